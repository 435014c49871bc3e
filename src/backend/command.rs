// Command pools and command buffers
//
// Frame command buffers are allocated once from a resettable pool and
// re-recorded every frame.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::GraphicsContext;

pub struct CommandPool {
    pub handle: vk::CommandPool,
    context: Arc<GraphicsContext>,
}

impl CommandPool {
    /// Pool on the graphics queue family whose buffers can be reset individually
    pub fn new(context: &Arc<GraphicsContext>) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(context.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let handle = unsafe { context.device.create_command_pool(&info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            handle,
            context: context.clone(),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.context.device.allocate_command_buffers(&info) }
            .context("Failed to allocate command buffers")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Command buffers are freed with the pool
        unsafe {
            self.context.device.destroy_command_pool(self.handle, None);
        }
    }
}

/// Reset and begin a command buffer for one-shot recording
pub fn begin_recording(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;
    }
    Ok(())
}
