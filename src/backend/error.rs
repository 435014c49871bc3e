// Typed construction errors for pipeline and descriptor builders

use ash::vk;
use thiserror::Error;

/// Why a builder refused to produce a pipeline object
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Graphics pipeline has no vertex shader")]
    MissingVertexShader,

    #[error("Graphics pipeline has no fragment shader")]
    MissingFragmentShader,

    #[error("Graphics pipeline has no render pass")]
    MissingRenderPass,

    #[error("Graphics pipeline has no pipeline layout")]
    MissingLayout,

    #[error("Graphics pipeline has no vertex input description")]
    MissingVertexInput,

    #[error("Descriptor binding {0} declared more than once")]
    DuplicateBinding(u32),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}
