// Engine loop
//
// Owns the scene and a backend and drives one frame per call. Knows nothing
// about the graphics API behind the backend.

use anyhow::Result;
use bevy_ecs::entity::Entity;
use std::path::Path;
use winit::keyboard::KeyCode;

use crate::render::RenderBackend;
use crate::scene::Scene;

/// Platform events forwarded to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Resized { width: u32, height: u32 },
    CloseRequested,
    KeyPressed(KeyCode),
}

pub struct Engine<B: RenderBackend> {
    backend: B,
    scene: Scene,
    frame_count: u64,
}

impl<B: RenderBackend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            scene: Scene::new(),
            frame_count: 0,
        }
    }

    /// Let the backend install its scene resources
    pub fn init(&mut self) -> Result<()> {
        log::info!("Starting engine on {:?} backend", self.backend.api());
        self.backend.on_init(&mut self.scene)
    }

    pub fn handle_event(&mut self, event: Event) {
        self.backend.on_event(&event);
    }

    /// Render one frame; `false` if the backend skipped it
    pub fn frame(&mut self) -> Result<bool> {
        if !self.backend.begin_frame()? {
            return Ok(false);
        }
        self.backend.render_scene(&mut self.scene)?;
        self.backend.end_frame()?;
        self.frame_count += 1;
        Ok(true)
    }

    /// Spawn an entity and load the model at `path` onto it
    pub fn load_model(&mut self, path: &Path) -> Result<Option<Entity>> {
        let entity = self.scene.spawn_empty();
        if self.backend.load_model(&mut self.scene, entity, path)? {
            Ok(Some(entity))
        } else {
            self.scene.despawn(entity);
            Ok(None)
        }
    }

    /// Unload a model spawned by [`Engine::load_model`] and despawn its entity
    pub fn unload_model(&mut self, entity: Entity) -> Result<()> {
        self.backend.unload_model(&mut self.scene, entity)?;
        self.scene.despawn(entity);
        Ok(())
    }

    pub fn set_environment_texture(&mut self, path: &Path) -> Result<()> {
        self.backend.set_environment_texture(&mut self.scene, path)
    }

    pub fn should_quit(&self) -> bool {
        self.backend.should_quit()
    }

    pub fn is_minimized(&self) -> bool {
        self.backend.is_minimized()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Ask the backend to stop; the loop exits on the next check
    pub fn shutdown(&mut self) {
        self.backend.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::GraphicsApi;
    use crate::scene::{Camera, Transform};

    #[derive(Default)]
    struct MockBackend {
        calls: Vec<&'static str>,
        decline_frames: usize,
        fail_load: bool,
        quit: bool,
        minimized: bool,
    }

    impl RenderBackend for MockBackend {
        fn api(&self) -> GraphicsApi {
            GraphicsApi::Vulkan
        }

        fn on_init(&mut self, scene: &mut Scene) -> Result<()> {
            self.calls.push("init");
            scene.spawn_camera(Transform::default(), Camera::default());
            Ok(())
        }

        fn on_event(&mut self, event: &Event) {
            match *event {
                Event::Resized { width, height } => self.minimized = width == 0 || height == 0,
                Event::CloseRequested => self.quit = true,
                Event::KeyPressed(_) => {}
            }
        }

        fn begin_frame(&mut self) -> Result<bool> {
            self.calls.push("begin");
            if self.decline_frames > 0 {
                self.decline_frames -= 1;
                return Ok(false);
            }
            Ok(true)
        }

        fn render_scene(&mut self, _scene: &mut Scene) -> Result<()> {
            self.calls.push("render");
            Ok(())
        }

        fn end_frame(&mut self) -> Result<()> {
            self.calls.push("end");
            Ok(())
        }

        fn set_environment_texture(&mut self, _scene: &mut Scene, _path: &Path) -> Result<()> {
            self.calls.push("environment");
            Ok(())
        }

        fn load_model(&mut self, _scene: &mut Scene, _entity: Entity, _path: &Path) -> Result<bool> {
            self.calls.push("load");
            Ok(!self.fail_load)
        }

        fn unload_model(&mut self, _scene: &mut Scene, _entity: Entity) -> Result<()> {
            self.calls.push("unload");
            Ok(())
        }

        fn should_quit(&self) -> bool {
            self.quit
        }

        fn stop(&mut self) {
            self.quit = true;
        }

        fn primary_framebuffer_handle(&self) -> Option<u64> {
            None
        }

        fn is_minimized(&self) -> bool {
            self.minimized
        }
    }

    #[test]
    fn frame_calls_backend_in_order() {
        let mut engine = Engine::new(MockBackend::default());
        engine.init().unwrap();
        assert!(engine.frame().unwrap());
        assert!(engine.frame().unwrap());

        assert_eq!(
            engine.backend.calls,
            vec!["init", "begin", "render", "end", "begin", "render", "end"]
        );
        assert_eq!(engine.frame_count(), 2);
        assert!(engine.scene.has_active_camera());
    }

    #[test]
    fn declined_frame_skips_render_and_end() {
        let mut engine = Engine::new(MockBackend {
            decline_frames: 1,
            ..Default::default()
        });
        assert!(!engine.frame().unwrap());
        assert!(engine.frame().unwrap());

        assert_eq!(
            engine.backend.calls,
            vec!["begin", "begin", "render", "end"]
        );
        assert_eq!(engine.frame_count(), 1);
    }

    #[test]
    fn failed_load_despawns_entity() {
        let mut engine = Engine::new(MockBackend {
            fail_load: true,
            ..Default::default()
        });
        assert_eq!(engine.load_model(Path::new("missing.obj")).unwrap(), None);
        assert_eq!(engine.scene.world.entities().len(), 0);

        engine.backend.fail_load = false;
        let entity = engine.load_model(Path::new("cube.obj")).unwrap();
        assert!(entity.is_some());
    }

    #[test]
    fn unload_despawns_model_entity() {
        let mut engine = Engine::new(MockBackend::default());
        let entity = engine.load_model(Path::new("cube.obj")).unwrap().unwrap();
        assert_eq!(engine.scene.world.entities().len(), 1);

        engine.unload_model(entity).unwrap();
        assert_eq!(engine.backend.calls, vec!["load", "unload"]);
        assert_eq!(engine.scene.world.entities().len(), 0);
    }

    #[test]
    fn events_reach_backend() {
        let mut engine = Engine::new(MockBackend::default());
        engine.handle_event(Event::Resized {
            width: 0,
            height: 0,
        });
        assert!(engine.is_minimized());
        engine.handle_event(Event::Resized {
            width: 640,
            height: 480,
        });
        assert!(!engine.is_minimized());

        assert!(!engine.should_quit());
        engine.handle_event(Event::CloseRequested);
        assert!(engine.should_quit());
    }

    #[test]
    fn shutdown_stops_backend() {
        let mut engine = Engine::new(MockBackend::default());
        engine.shutdown();
        assert!(engine.should_quit());
    }
}
