// Buffer utilities for vertex, index, uniform and staging buffers
//
// Device-local buffers are filled through a transient staging buffer.
// Uniform and staging buffers stay host-visible and persistently mapped.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::GraphicsContext;

/// What a buffer is used for; decides usage flags and memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Staging,
}

impl BufferUsage {
    pub fn flags(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    pub fn location(self) -> MemoryLocation {
        match self {
            BufferUsage::Vertex | BufferUsage::Index => MemoryLocation::GpuOnly,
            BufferUsage::Uniform | BufferUsage::Staging => MemoryLocation::CpuToGpu,
        }
    }

    /// Host-visible buffers are written directly instead of staged
    pub fn is_host_visible(self) -> bool {
        self.location() == MemoryLocation::CpuToGpu
    }
}

/// A GPU buffer with its allocation, freed on drop
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    context: Arc<GraphicsContext>,
}

impl GpuBuffer {
    /// Allocate an uninitialised buffer of `size` bytes
    pub fn new(
        context: &Arc<GraphicsContext>,
        size: vk::DeviceSize,
        usage: BufferUsage,
        name: &str,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Cannot create zero-sized buffer '{}'", name);
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { context.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { context.device.get_buffer_memory_requirements(handle) };

        let allocation = context.with_allocator(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: usage.location(),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { context.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        // Constructed before binding so a bind failure still releases both
        let buffer = Self {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            context: context.clone(),
        };

        if let Some(allocation) = &buffer.allocation {
            unsafe {
                context
                    .device
                    .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
            }
            .context("Failed to bind buffer memory")?;
        }

        Ok(buffer)
    }

    /// Create a buffer holding `data`
    ///
    /// Device-local usages go through a staging buffer and a one-time copy
    /// command; the staging buffer is destroyed once the copy has retired.
    pub fn with_data<T: bytemuck::Pod>(
        context: &Arc<GraphicsContext>,
        usage: BufferUsage,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        if usage.is_host_visible() {
            let mut buffer = Self::new(context, size, usage, name)?;
            buffer.write(0, bytes)?;
            return Ok(buffer);
        }

        let mut staging = Self::new(
            context,
            size,
            BufferUsage::Staging,
            &format!("{} (staging)", name),
        )?;
        staging.write(0, bytes)?;

        let buffer = Self::new(context, size, usage, name)?;
        context.submit_one_time(|device, cmd| {
            let region = vk::BufferCopy::default().size(size);
            unsafe {
                device.cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]);
            }
        })?;

        Ok(buffer)
    }

    /// Copy `data` into a host-visible buffer at byte `offset`
    pub fn write<T: bytemuck::Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let end = offset + bytes.len() as vk::DeviceSize;
        if end > self.size {
            anyhow::bail!(
                "Write of {} bytes at offset {} overflows buffer of {} bytes",
                bytes.len(),
                offset,
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .with_context(|| format!("{:?} buffer is not host-visible", self.usage))?;

        mapped[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let freed = self
                .context
                .with_allocator(|allocator| allocator.free(allocation).map_err(Into::into));
            if let Err(e) = freed {
                log::warn!("Failed to free buffer memory: {:#}", e);
            }
        }
        unsafe {
            self.context.device.destroy_buffer(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_usages_accept_transfers() {
        for usage in [BufferUsage::Vertex, BufferUsage::Index] {
            assert!(usage.flags().contains(vk::BufferUsageFlags::TRANSFER_DST));
            assert_eq!(usage.location(), MemoryLocation::GpuOnly);
            assert!(!usage.is_host_visible());
        }
    }

    #[test]
    fn uniform_and_staging_are_mapped() {
        assert!(BufferUsage::Uniform.is_host_visible());
        assert!(BufferUsage::Staging.is_host_visible());
        assert!(BufferUsage::Staging
            .flags()
            .contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(BufferUsage::Uniform
            .flags()
            .contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }
}
