// Render data stored in the scene
//
// Models, meshes and materials are ECS components; the image cache, render
// options and retired models are scene resources the backend installs in
// on_init.

use anyhow::Result;
use ash::vk;
use bevy_ecs::component::ComponentId;
use bevy_ecs::prelude::*;
use bevy_ecs::world::DeferredWorld;
use glam::{Mat4, Vec3};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assets;
use crate::backend::buffer::GpuBuffer;
use crate::backend::image::{GpuImage, Sampler};
use crate::backend::GraphicsContext;

use super::uniforms::MaterialBuffer;

/// Non-owning handle to an image held by the [`ImageCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageKey(usize);

/// Surface description of a mesh; lives on its own entity
#[derive(Component, Debug, Clone, PartialEq)]
pub struct Material {
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub emission: Vec3,
    pub shininess: f32,
    pub opacity: f32,
    pub ambient_texture: Option<ImageKey>,
    pub diffuse_texture: Option<ImageKey>,
    pub specular_texture: Option<ImageKey>,
    pub emission_texture: Option<ImageKey>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: Vec3::splat(0.1),
            diffuse: Vec3::splat(0.8),
            specular: Vec3::ZERO,
            emission: Vec3::ZERO,
            shininess: 1.0,
            opacity: 1.0,
            ambient_texture: None,
            diffuse_texture: None,
            specular_texture: None,
            emission_texture: None,
        }
    }
}

impl Material {
    /// Values as laid out in the fragment shader's material block
    ///
    /// `environment` tells the shader whether the environment texture is
    /// bound; it travels in the emission alpha.
    pub fn uniform(&self, environment: bool) -> MaterialBuffer {
        MaterialBuffer {
            ambient: self.ambient.extend(1.0),
            diffuse: self.diffuse.extend(self.opacity),
            specular: self.specular.extend(self.shininess),
            emission: self.emission.extend(if environment { 1.0 } else { 0.0 }),
            has_ambient_tex: self.ambient_texture.is_some() as i32,
            has_diffuse_tex: self.diffuse_texture.is_some() as i32,
            has_specular_tex: self.specular_texture.is_some() as i32,
            has_emission_tex: self.emission_texture.is_some() as i32,
        }
    }

    /// Texture slots paired with their descriptor binding
    pub fn textures(&self) -> [(u32, Option<ImageKey>); 4] {
        use super::uniforms::bindings;
        [
            (bindings::AMBIENT_TEXTURE, self.ambient_texture),
            (bindings::DIFFUSE_TEXTURE, self.diffuse_texture),
            (bindings::SPECULAR_TEXTURE, self.specular_texture),
            (bindings::EMISSION_TEXTURE, self.emission_texture),
        ]
    }
}

/// GPU geometry of one mesh
pub struct Mesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    /// Entity carrying this mesh's [`Material`]
    pub material: Entity,
    pub local_transform: Mat4,
}

/// A loaded model: its meshes and the material entities spawned for it
#[derive(Component)]
pub struct Model {
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Entity>,
    pub source: PathBuf,
}

/// Meshes and material entities of models removed from the scene, waiting
/// for the backend to retire them once no frame in flight reads them
#[derive(Resource, Default)]
pub struct RetiredModels {
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Entity>,
}

/// Route every removal of a [`Model`] (despawn included) through
/// [`RetiredModels`] instead of dropping its buffers on the spot.
///
/// Must run before the first model is spawned.
pub fn track_model_removal(world: &mut World) {
    if world.contains_resource::<RetiredModels>() {
        return;
    }
    world.init_resource::<RetiredModels>();
    world.register_component_hooks::<Model>().on_remove(retire_model);
}

fn retire_model(mut world: DeferredWorld, entity: Entity, _: ComponentId) {
    let (meshes, materials) = match world.get_mut::<Model>(entity) {
        Some(mut model) => (
            std::mem::take(&mut model.meshes),
            std::mem::take(&mut model.materials),
        ),
        None => return,
    };
    if let Some(mut retired) = world.get_resource_mut::<RetiredModels>() {
        retired.meshes.extend(meshes);
        retired.materials.extend(materials);
    }
}

/// Per-scene render settings
#[derive(Resource, Debug, Clone)]
pub struct RenderOptions {
    pub clear_color: [f32; 4],
    pub environment: Option<ImageKey>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.2, 0.8, 1.0],
            environment: None,
        }
    }
}

/// Cached images by source file and GPU format
///
/// The same file uploaded as sRGB and as linear data is two images.
#[derive(Default)]
struct ImageIndex {
    keys: HashMap<(PathBuf, vk::Format), ImageKey>,
}

impl ImageIndex {
    fn get(&self, path: &Path, format: vk::Format) -> Option<ImageKey> {
        self.keys.get(&(path.to_path_buf(), format)).copied()
    }

    fn insert(&mut self, path: &Path, format: vk::Format, key: ImageKey) {
        self.keys.insert((path.to_path_buf(), format), key);
    }
}

/// Owner of every sampled image, deduplicated by path and format
#[derive(Resource)]
pub struct ImageCache {
    images: Vec<GpuImage>,
    index: ImageIndex,
    sampler: Sampler,
    mipmaps: bool,
    context: Arc<GraphicsContext>,
}

impl ImageCache {
    pub fn new(context: &Arc<GraphicsContext>, mipmaps: bool) -> Result<Self> {
        Ok(Self {
            images: Vec::new(),
            index: ImageIndex::default(),
            sampler: Sampler::new(context)?,
            mipmaps,
            context: context.clone(),
        })
    }

    /// Load (or reuse) the image at `path` uploaded as `format`
    ///
    /// Decoding failures are logged and give `Ok(None)`; GPU failures are errors.
    pub fn load(&mut self, path: &Path, format: vk::Format) -> Result<Option<ImageKey>> {
        if let Some(key) = self.index.get(path, format) {
            return Ok(Some(key));
        }

        let Some(texture) = assets::load_texture_data(path, 4) else {
            return Ok(None);
        };

        let image = GpuImage::from_pixels(
            &self.context,
            &texture.pixels,
            texture.width,
            texture.height,
            format,
            self.mipmaps,
            &path.display().to_string(),
        )?;

        let extent = image.extent();
        log::info!(
            "Loaded texture {} ({}x{}, {:?}, {} mip levels, {:?})",
            path.display(),
            extent.width,
            extent.height,
            image.format(),
            image.mip_levels(),
            image.layout()
        );

        let key = ImageKey(self.images.len());
        self.images.push(image);
        self.index.insert(path, format, key);
        Ok(Some(key))
    }

    pub fn get(&self, key: ImageKey) -> &GpuImage {
        &self.images[key.0]
    }

    /// Shared sampler used for every cached image
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_uniform_flags_follow_textures() {
        let material = Material {
            diffuse_texture: Some(ImageKey(3)),
            emission_texture: Some(ImageKey(0)),
            shininess: 32.0,
            opacity: 0.5,
            ..Default::default()
        };

        let uniform = material.uniform(false);
        assert_eq!(uniform.has_ambient_tex, 0);
        assert_eq!(uniform.has_diffuse_tex, 1);
        assert_eq!(uniform.has_specular_tex, 0);
        assert_eq!(uniform.has_emission_tex, 1);
        assert_eq!(uniform.specular.w, 32.0);
        assert_eq!(uniform.diffuse.w, 0.5);
    }

    #[test]
    fn environment_flag_rides_in_emission_alpha() {
        let material = Material {
            emission: Vec3::new(0.2, 0.3, 0.4),
            ..Default::default()
        };
        assert_eq!(material.uniform(true).emission.w, 1.0);
        assert_eq!(material.uniform(false).emission.w, 0.0);
        assert_eq!(material.uniform(true).emission.truncate(), material.emission);
    }

    #[test]
    fn same_file_in_two_formats_is_two_images() {
        let mut index = ImageIndex::default();
        let path = Path::new("textures/brick.png");
        index.insert(path, vk::Format::R8G8B8A8_SRGB, ImageKey(0));

        assert_eq!(
            index.get(path, vk::Format::R8G8B8A8_SRGB),
            Some(ImageKey(0))
        );
        assert_eq!(index.get(path, vk::Format::R8G8B8A8_UNORM), None);

        index.insert(path, vk::Format::R8G8B8A8_UNORM, ImageKey(1));
        assert_eq!(
            index.get(path, vk::Format::R8G8B8A8_UNORM),
            Some(ImageKey(1))
        );
        assert_eq!(
            index.get(path, vk::Format::R8G8B8A8_SRGB),
            Some(ImageKey(0))
        );
    }

    fn empty_model(world: &mut World) -> (Entity, Vec<Entity>) {
        let materials = vec![
            world.spawn(Material::default()).id(),
            world.spawn(Material::default()).id(),
        ];
        let entity = world
            .spawn(Model {
                meshes: Vec::new(),
                materials: materials.clone(),
                source: PathBuf::from("cube.obj"),
            })
            .id();
        (entity, materials)
    }

    #[test]
    fn despawned_model_is_retired_not_dropped() {
        let mut world = World::new();
        track_model_removal(&mut world);
        let (entity, materials) = empty_model(&mut world);

        assert!(world.despawn(entity));

        let retired = world.resource::<RetiredModels>();
        assert_eq!(retired.materials, materials);
        // Material entities stay until the backend collects them
        assert!(materials.iter().all(|m| world.get::<Material>(*m).is_some()));
    }

    #[test]
    fn removed_model_component_is_retired() {
        let mut world = World::new();
        track_model_removal(&mut world);
        // A second install must not register the hook twice
        track_model_removal(&mut world);
        let (entity, materials) = empty_model(&mut world);

        world.entity_mut(entity).remove::<Model>();

        assert_eq!(world.resource::<RetiredModels>().materials, materials);
        assert!(world.get_entity(entity).is_some());
    }

    #[test]
    fn texture_slots_map_to_bindings() {
        let material = Material {
            specular_texture: Some(ImageKey(1)),
            ..Default::default()
        };
        let present: Vec<u32> = material
            .textures()
            .iter()
            .filter_map(|(binding, key)| key.map(|_| *binding))
            .collect();
        assert_eq!(present, vec![4]);
    }
}
