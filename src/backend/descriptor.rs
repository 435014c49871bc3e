// Descriptor set layouts and push descriptor writes
//
// The mesh pipeline uses a single push-descriptor set, so per-draw
// resources are written straight into the command buffer instead of
// being allocated from a pool.

use ash::vk;
use std::sync::Arc;

use super::error::PipelineError;
use super::GraphicsContext;

/// Descriptor set layout builder
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    push: bool,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    pub fn combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
        )
    }

    /// Values for this set are pushed with `vkCmdPushDescriptorSetKHR`
    pub fn push_descriptor(mut self) -> Self {
        self.push = true;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for (i, a) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == a.binding) {
                return Err(PipelineError::DuplicateBinding(a.binding));
            }
        }
        Ok(())
    }

    pub fn build(self, context: &Arc<GraphicsContext>) -> Result<DescriptorSetLayout, PipelineError> {
        self.validate()?;

        let flags = if self.push {
            vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        };
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(flags)
            .bindings(&self.bindings);

        let handle = unsafe {
            context
                .device
                .create_descriptor_set_layout(&layout_info, None)?
        };

        Ok(DescriptorSetLayout {
            handle,
            context: context.clone(),
        })
    }
}

pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    context: Arc<GraphicsContext>,
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

/// Descriptor values for one draw, pushed into the command stream
#[derive(Default)]
pub struct DescriptorWrites {
    buffers: Vec<(u32, vk::DescriptorBufferInfo)>,
    images: Vec<(u32, vk::DescriptorImageInfo)>,
}

impl DescriptorWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
    }

    pub fn uniform_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.buffers.push((
            binding,
            vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
        ));
        self
    }

    pub fn combined_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> &mut Self {
        self.images.push((
            binding,
            vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ));
        self
    }

    /// Bindings written so far, buffers first
    #[cfg(test)]
    fn bindings(&self) -> Vec<u32> {
        self.buffers
            .iter()
            .map(|(b, _)| *b)
            .chain(self.images.iter().map(|(b, _)| *b))
            .collect()
    }

    fn writes(&self) -> Vec<vk::WriteDescriptorSet<'_>> {
        let buffers = self.buffers.iter().map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(info))
        });
        let images = self.images.iter().map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(info))
        });
        buffers.chain(images).collect()
    }

    /// Record the writes into `cmd` for set `set` of `layout`
    pub fn push(
        &self,
        context: &GraphicsContext,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: u32,
    ) {
        let writes = self.writes();
        if writes.is_empty() {
            return;
        }
        unsafe {
            context.push_descriptor.cmd_push_descriptor_set(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set,
                &writes,
            );
        }
    }
}
