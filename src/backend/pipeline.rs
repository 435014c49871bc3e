// Render pass and graphics pipeline construction
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Builders collect state and only validate it in build(); nothing required
// is ever defaulted.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::error::PipelineError;
use super::GraphicsContext;

/// Render pass with one color and one depth attachment
pub struct RenderPass {
    pub handle: vk::RenderPass,
    color_format: vk::Format,
    context: Arc<GraphicsContext>,
}

impl RenderPass {
    pub fn new(
        context: &Arc<GraphicsContext>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        // Depth attachment
        let depth_attachment = vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let color_attachment_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let depth_attachment_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        // Single subpass with color and depth
        let color_attachments = [color_attachment_ref];
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments)
            .depth_stencil_attachment(&depth_attachment_ref);

        // Wait for the acquired image and the previous frame's depth writes
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let attachments = [color_attachment, depth_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { context.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(Self {
            handle,
            color_format,
            context: context.clone(),
        })
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_render_pass(self.handle, None);
        }
    }
}

/// Create framebuffers for each swapchain image (with depth attachment)
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    depth_image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());
    for &image_view in image_views {
        let attachments = [image_view, depth_image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(e).context("Failed to create framebuffer");
            }
        }
    }
    Ok(framebuffers)
}

/// Persists compiled pipeline state across pipeline creations
pub struct PipelineCache {
    pub handle: vk::PipelineCache,
    context: Arc<GraphicsContext>,
}

impl PipelineCache {
    pub fn new(context: &Arc<GraphicsContext>) -> Result<Self> {
        let info = vk::PipelineCacheCreateInfo::default();
        let handle = unsafe { context.device.create_pipeline_cache(&info, None) }
            .context("Failed to create pipeline cache")?;
        Ok(Self {
            handle,
            context: context.clone(),
        })
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline_cache(self.handle, None);
        }
    }
}

#[derive(Default)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constants: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }

    pub fn push_constant(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn build(self, context: &Arc<GraphicsContext>) -> Result<PipelineLayout, PipelineError> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constants);

        let handle = unsafe { context.device.create_pipeline_layout(&layout_info, None)? };

        Ok(PipelineLayout {
            handle,
            context: context.clone(),
        })
    }
}

pub struct PipelineLayout {
    pub handle: vk::PipelineLayout,
    context: Arc<GraphicsContext>,
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

/// Fluent description of a graphics pipeline
pub struct GraphicsPipelineBuilder {
    vertex_shader: Option<vk::ShaderModule>,
    fragment_shader: Option<vk::ShaderModule>,
    render_pass: Option<vk::RenderPass>,
    layout: Option<vk::PipelineLayout>,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    cull_mode: vk::CullModeFlags,
    depth_test: bool,
}

impl Default for GraphicsPipelineBuilder {
    fn default() -> Self {
        Self {
            vertex_shader: None,
            fragment_shader: None,
            render_pass: None,
            layout: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
        }
    }
}

impl GraphicsPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_shader(mut self, module: vk::ShaderModule) -> Self {
        self.vertex_shader = Some(module);
        self
    }

    pub fn fragment_shader(mut self, module: vk::ShaderModule) -> Self {
        self.fragment_shader = Some(module);
        self
    }

    pub fn render_pass(mut self, render_pass: vk::RenderPass) -> Self {
        self.render_pass = Some(render_pass);
        self
    }

    pub fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn vertex_input(
        mut self,
        bindings: &[vk::VertexInputBindingDescription],
        attributes: &[vk::VertexInputAttributeDescription],
    ) -> Self {
        self.vertex_bindings = bindings.to_vec();
        self.vertex_attributes = attributes.to_vec();
        self
    }

    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }

    /// Check that every required piece of state was supplied
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.required().map(|_| ())
    }

    fn required(
        &self,
    ) -> Result<
        (
            vk::ShaderModule,
            vk::ShaderModule,
            vk::RenderPass,
            vk::PipelineLayout,
        ),
        PipelineError,
    > {
        fn present<T: vk::Handle + Copy>(
            handle: Option<T>,
            missing: PipelineError,
        ) -> Result<T, PipelineError> {
            handle.filter(|h| !h.is_null()).ok_or(missing)
        }

        let vertex_shader = present(self.vertex_shader, PipelineError::MissingVertexShader)?;
        let fragment_shader =
            present(self.fragment_shader, PipelineError::MissingFragmentShader)?;
        let render_pass = present(self.render_pass, PipelineError::MissingRenderPass)?;
        let layout = present(self.layout, PipelineError::MissingLayout)?;
        if self.vertex_bindings.is_empty() || self.vertex_attributes.is_empty() {
            return Err(PipelineError::MissingVertexInput);
        }
        Ok((vertex_shader, fragment_shader, render_pass, layout))
    }

    pub fn build(
        self,
        context: &Arc<GraphicsContext>,
        cache: &PipelineCache,
    ) -> Result<Pipeline, PipelineError> {
        let (vertex_shader, fragment_shader, render_pass, layout) = self.required()?;

        let entry_point = c"main";

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_shader)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_shader)
                .name(entry_point),
        ];

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are set per frame from the swapchain extent
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_test)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending (no blending, opaque)
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            context
                .device
                .create_graphics_pipelines(cache.handle, &[pipeline_info], None)
                .map_err(|(_, e)| PipelineError::Vulkan(e))?
        };

        Ok(Pipeline {
            handle: pipelines[0],
            context: context.clone(),
        })
    }
}

pub struct Pipeline {
    pub handle: vk::Pipeline,
    context: Arc<GraphicsContext>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn complete() -> GraphicsPipelineBuilder {
        let bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attributes = [vk::VertexInputAttributeDescription::default()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)];

        GraphicsPipelineBuilder::new()
            .vertex_shader(vk::ShaderModule::from_raw(1))
            .fragment_shader(vk::ShaderModule::from_raw(2))
            .render_pass(vk::RenderPass::from_raw(3))
            .layout(vk::PipelineLayout::from_raw(4))
            .vertex_input(&bindings, &attributes)
    }

    #[test]
    fn complete_description_validates() {
        assert_eq!(complete().validate(), Ok(()));
    }

    #[test]
    fn missing_vertex_shader() {
        let mut builder = complete();
        builder.vertex_shader = None;
        assert_eq!(builder.validate(), Err(PipelineError::MissingVertexShader));
    }

    #[test]
    fn missing_fragment_shader() {
        let builder = complete().fragment_shader(vk::ShaderModule::null());
        assert_eq!(
            builder.validate(),
            Err(PipelineError::MissingFragmentShader)
        );
    }

    #[test]
    fn missing_render_pass() {
        let mut builder = complete();
        builder.render_pass = None;
        assert_eq!(builder.validate(), Err(PipelineError::MissingRenderPass));
    }

    #[test]
    fn missing_layout() {
        let mut builder = complete();
        builder.layout = None;
        assert_eq!(builder.validate(), Err(PipelineError::MissingLayout));
    }

    #[test]
    fn missing_vertex_input() {
        let builder = complete().vertex_input(&[], &[]);
        assert_eq!(builder.validate(), Err(PipelineError::MissingVertexInput));
    }

    #[test]
    fn empty_builder_reports_first_missing_piece() {
        assert_eq!(
            GraphicsPipelineBuilder::new().validate(),
            Err(PipelineError::MissingVertexShader)
        );
    }
}
