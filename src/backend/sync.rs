// Synchronization primitives
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU sync.
// Each wrapper owns its handle and destroys it on drop.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::GraphicsContext;

/// CPU-waitable signal raised by the GPU when a submission retires
pub struct Fence {
    pub handle: vk::Fence,
    context: Arc<GraphicsContext>,
}

impl Fence {
    /// Frame fences start signaled so the first wait on them returns at once
    pub fn new(context: &Arc<GraphicsContext>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);

        let handle = unsafe { context.device.create_fence(&info, None) }
            .context("Failed to create fence")?;

        Ok(Self {
            handle,
            context: context.clone(),
        })
    }

    /// Block until the fence is signaled (no timeout)
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.context
                .device
                .wait_for_fences(&[self.handle], true, u64::MAX)
        }
        .context("Failed to wait for fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.context.device.reset_fences(&[self.handle]) }
            .context("Failed to reset fence")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_fence(self.handle, None);
        }
    }
}

/// GPU-side ordering between queue operations
pub struct Semaphore {
    pub handle: vk::Semaphore,
    context: Arc<GraphicsContext>,
}

impl Semaphore {
    pub fn new(context: &Arc<GraphicsContext>) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { context.device.create_semaphore(&info, None) }
            .context("Failed to create semaphore")?;

        Ok(Self {
            handle,
            context: context.clone(),
        })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_semaphore(self.handle, None);
        }
    }
}
