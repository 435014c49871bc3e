// Render module - backend abstraction
//
// The engine loop talks to a RenderBackend and never to Vulkan directly.
// The set of backends is closed and chosen once at startup from config.

pub mod components;
pub mod frame;
pub mod uniforms;
pub mod vulkan;

use anyhow::Result;
use bevy_ecs::entity::Entity;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use winit::window::Window;

use crate::config::Config;
use crate::engine::Event;
use crate::scene::Scene;

pub use vulkan::VulkanBackend;

/// Graphics APIs a backend can be built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsApi {
    /// Immediate-mode GL-style API
    Legacy,
    Vulkan,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unsupported graphics API: {0:?}")]
    UnsupportedApi(GraphicsApi),
}

/// What the engine loop needs from a renderer
pub trait RenderBackend {
    fn api(&self) -> GraphicsApi;

    /// Install the image cache, render options and a default camera
    fn on_init(&mut self, scene: &mut Scene) -> Result<()>;

    fn on_event(&mut self, event: &Event);

    /// Start a frame; `false` means skip rendering this iteration
    fn begin_frame(&mut self) -> Result<bool>;

    fn render_scene(&mut self, scene: &mut Scene) -> Result<()>;

    fn end_frame(&mut self) -> Result<()>;

    fn set_environment_texture(&mut self, scene: &mut Scene, path: &Path) -> Result<()>;

    /// Load (or replace) the model on `entity`; `false` if the file could not be decoded
    fn load_model(&mut self, scene: &mut Scene, entity: Entity, path: &Path) -> Result<bool>;

    /// Remove the model on `entity` once no frame in flight uses it
    fn unload_model(&mut self, scene: &mut Scene, entity: Entity) -> Result<()>;

    fn should_quit(&self) -> bool;

    fn stop(&mut self);

    /// Raw handle of the framebuffer being rendered, if a frame is recording
    fn primary_framebuffer_handle(&self) -> Option<u64>;

    fn is_minimized(&self) -> bool;
}

impl<B: RenderBackend + ?Sized> RenderBackend for Box<B> {
    fn api(&self) -> GraphicsApi {
        (**self).api()
    }

    fn on_init(&mut self, scene: &mut Scene) -> Result<()> {
        (**self).on_init(scene)
    }

    fn on_event(&mut self, event: &Event) {
        (**self).on_event(event)
    }

    fn begin_frame(&mut self) -> Result<bool> {
        (**self).begin_frame()
    }

    fn render_scene(&mut self, scene: &mut Scene) -> Result<()> {
        (**self).render_scene(scene)
    }

    fn end_frame(&mut self) -> Result<()> {
        (**self).end_frame()
    }

    fn set_environment_texture(&mut self, scene: &mut Scene, path: &Path) -> Result<()> {
        (**self).set_environment_texture(scene, path)
    }

    fn load_model(&mut self, scene: &mut Scene, entity: Entity, path: &Path) -> Result<bool> {
        (**self).load_model(scene, entity, path)
    }

    fn unload_model(&mut self, scene: &mut Scene, entity: Entity) -> Result<()> {
        (**self).unload_model(scene, entity)
    }

    fn should_quit(&self) -> bool {
        (**self).should_quit()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn primary_framebuffer_handle(&self) -> Option<u64> {
        (**self).primary_framebuffer_handle()
    }

    fn is_minimized(&self) -> bool {
        (**self).is_minimized()
    }
}

/// Build the backend selected in the config
pub fn create_backend(window: Arc<Window>, config: &Config) -> Result<Box<dyn RenderBackend>> {
    match config.graphics.api {
        GraphicsApi::Vulkan => Ok(Box::new(VulkanBackend::new(window, config)?)),
        GraphicsApi::Legacy => Err(BackendError::UnsupportedApi(GraphicsApi::Legacy).into()),
    }
}
