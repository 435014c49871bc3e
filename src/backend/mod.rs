// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Every object holds the shared
// GraphicsContext so it can destroy itself, and the context outlives them all.

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use context::{GraphicsContext, Surface};
