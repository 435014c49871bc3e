// Scene - entity store the renderer draws from
//
// A thin layer over a bevy_ecs World: transforms, cameras, the active
// camera, and resources the backend installs (image cache, render options).

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

use crate::render::GraphicsApi;

#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    /// Orient so that -Z points from `translation` towards `target`
    pub fn looking_at(mut self, target: Vec3, up: Vec3) -> Self {
        let view = Mat4::look_at_rh(self.translation, target, up);
        self.rotation = Quat::from_mat4(&view.inverse());
        self
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// World-to-view matrix for a camera placed at this transform
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation).inverse()
    }
}

/// Perspective camera
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov_y: 60f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Projection for the given API's clip space
    ///
    /// Vulkan clip space has Y pointing down and depth in 0..1, so its
    /// projection is the GL one with Y flipped and a remapped depth range.
    pub fn projection(&self, api: GraphicsApi) -> Mat4 {
        match api {
            GraphicsApi::Legacy => {
                Mat4::perspective_rh_gl(self.fov_y, self.aspect, self.near, self.far)
            }
            GraphicsApi::Vulkan => {
                let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
                proj.y_axis.y *= -1.0;
                proj
            }
        }
    }

    pub fn with_aspect(mut self, width: u32, height: u32) -> Self {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
        self
    }
}

/// Entity store plus the active camera
pub struct Scene {
    pub world: World,
    active_camera: Option<Entity>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            active_camera: None,
        }
    }

    /// Spawn a camera; the first one spawned becomes active
    pub fn spawn_camera(&mut self, transform: Transform, camera: Camera) -> Entity {
        let entity = self.world.spawn((transform, camera)).id();
        if !self.has_active_camera() {
            self.active_camera = Some(entity);
        }
        entity
    }

    pub fn has_active_camera(&self) -> bool {
        self.get_active_camera().is_some()
    }

    pub fn get_active_camera(&self) -> Option<(Entity, Camera)> {
        let entity = self.active_camera?;
        self.world.get::<Camera>(entity).map(|camera| (entity, *camera))
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.world.get::<T>(entity)
    }

    pub fn spawn_empty(&mut self) -> Entity {
        self.world.spawn_empty().id()
    }

    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    pub fn resource<R: Resource>(&self) -> Option<&R> {
        self.world.get_resource::<R>()
    }

    pub fn resource_mut<R: Resource>(&mut self) -> Option<Mut<'_, R>> {
        self.world.get_resource_mut::<R>()
    }

    pub fn insert_resource<R: Resource>(&mut self, resource: R) {
        self.world.insert_resource(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn first_camera_becomes_active() {
        let mut scene = Scene::new();
        assert!(!scene.has_active_camera());

        let first = scene.spawn_camera(Transform::default(), Camera::default());
        let _second = scene.spawn_camera(Transform::default(), Camera::default());

        let (active, _) = scene.get_active_camera().unwrap();
        assert_eq!(active, first);
    }

    #[test]
    fn despawned_camera_is_not_active() {
        let mut scene = Scene::new();
        let camera = scene.spawn_camera(Transform::default(), Camera::default());
        assert!(scene.despawn(camera));
        assert!(!scene.has_active_camera());
    }

    #[test]
    fn vulkan_projection_flips_y() {
        let camera = Camera::default();
        let gl = camera.projection(GraphicsApi::Legacy);
        let vk = camera.projection(GraphicsApi::Vulkan);

        assert!(gl.y_axis.y > 0.0);
        assert!(vk.y_axis.y < 0.0);
        assert_relative_eq!(gl.y_axis.y, -vk.y_axis.y, epsilon = 1e-6);

        // Same point lands mirrored vertically in clip space
        let p = Vec3::new(0.3, 0.4, -5.0).extend(1.0);
        let a = gl * p;
        let b = vk * p;
        assert_relative_eq!(a.y / a.w, -(b.y / b.w), epsilon = 1e-5);
        assert_relative_eq!(a.x / a.w, b.x / b.w, epsilon = 1e-5);
    }

    #[test]
    fn vulkan_depth_is_zero_to_one() {
        let camera = Camera::default();
        let vk = camera.projection(GraphicsApi::Vulkan);
        let near = vk * Vec3::new(0.0, 0.0, -camera.near).extend(1.0);
        let far = vk * Vec3::new(0.0, 0.0, -camera.far).extend(1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn looking_at_points_minus_z_at_target() {
        let transform =
            Transform::from_translation(Vec3::new(0.0, 0.0, 5.0)).looking_at(Vec3::ZERO, Vec3::Y);
        let target_in_view = transform.view_matrix().transform_point3(Vec3::ZERO);
        assert_relative_eq!(target_in_view.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(target_in_view.z, -5.0, epsilon = 1e-5);
    }

    #[test]
    fn aspect_ignores_zero_extent() {
        let camera = Camera::default().with_aspect(0, 0);
        assert_eq!(camera.aspect, Camera::default().aspect);
        assert_relative_eq!(Camera::default().with_aspect(800, 400).aspect, 2.0);
    }
}
