// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time by
// build.rs and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::GraphicsContext;

/// Owned shader module, destroyed on drop
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    context: Arc<GraphicsContext>,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytes
    pub fn from_bytes(context: &Arc<GraphicsContext>, bytes: &[u8]) -> Result<Self> {
        // read_spv checks the magic number and copies into aligned words
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        let handle = unsafe { context.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            handle,
            context: context.clone(),
        })
    }

    /// Read and create a shader module from a `.spv` file
    pub fn load(context: &Arc<GraphicsContext>, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader {}", path.display()))?;
        Self::from_bytes(context, &bytes)
            .with_context(|| format!("Failed to load shader {}", path.display()))
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_shader_module(self.handle, None);
        }
    }
}
