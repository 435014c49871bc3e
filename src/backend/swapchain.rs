// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the depth buffer and framebuffers that follow its extent.
// Negotiation is pure so the same surface state always yields the same
// format, extent and present mode.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::image::GpuImage;
use super::pipeline::{create_framebuffers, RenderPass};
use super::GraphicsContext;

/// What the surface can do right now
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(context: &GraphicsContext, surface: vk::SurfaceKHR) -> Result<Self> {
        let loader = &context.surface_loader;
        let physical_device = context.physical_device;

        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query present modes")?,
            })
        }
    }
}

/// Negotiated swapchain parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainConfig {
    /// Pick swapchain parameters for `requested` window size.
    ///
    /// Returns `None` while the surface has no area (minimized window) or
    /// reports no formats.
    pub fn negotiate(
        support: &SurfaceSupport,
        requested: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Option<Self> {
        let extent = choose_extent(&support.capabilities, requested);
        if extent.width == 0 || extent.height == 0 {
            return None;
        }

        Some(Self {
            surface_format: choose_surface_format(&support.formats)?,
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            extent,
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// Prefer B8G8R8A8_SRGB/SRGB_NONLINEAR, then any 8-bit sRGB format, then the first one
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let srgb_8bit = [
        vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8A8_SRGB,
        vk::Format::A8B8G8R8_SRGB_PACK32,
    ];

    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| {
            formats.iter().find(|f| {
                srgb_8bit.contains(&f.format) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the preferred mode when offered, FIFO otherwise (always supported)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: requested.width.max(min.width).min(max.width),
        height: requested.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum so we never wait on the driver, capped at the maximum
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Lifecycle of the swapchain
///
/// The only record of whether a rebuild is due; the frame pacer asks
/// through [`SwapchainState::needs_rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    /// Out of date with the surface (resize, suboptimal, minimized)
    Stale,
    /// Torn down and not yet rebuilt; stays here if the rebuild failed
    Recreating,
    Destroyed,
}

impl SwapchainState {
    pub fn needs_rebuild(self) -> bool {
        matches!(self, Self::Stale | Self::Recreating)
    }

    fn marked_stale(self) -> Self {
        match self {
            Self::Ready => Self::Stale,
            other => other,
        }
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    depth: Option<GpuImage>,
    config: SwapchainConfig,
    state: SwapchainState,
    surface: vk::SurfaceKHR,
    context: Arc<GraphicsContext>,
}

impl Swapchain {
    /// Create the swapchain and its per-image resources
    ///
    /// `surface` must outlive the returned swapchain.
    pub fn new(
        context: &Arc<GraphicsContext>,
        surface: vk::SurfaceKHR,
        config: SwapchainConfig,
        render_pass: &RenderPass,
    ) -> Result<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            depth: None,
            config,
            state: SwapchainState::Uninitialized,
            surface,
            context: context.clone(),
        };
        swapchain.build(config, render_pass)?;
        Ok(swapchain)
    }

    /// Rebuild everything for the surface's current state
    ///
    /// Returns `false` (and stays stale) while the window is minimized.
    pub fn recreate(
        &mut self,
        requested: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        render_pass: &RenderPass,
    ) -> Result<bool> {
        let support = SurfaceSupport::query(&self.context, self.surface)?;
        let Some(config) = SwapchainConfig::negotiate(&support, requested, preferred_present_mode)
        else {
            self.state = SwapchainState::Stale;
            return Ok(false);
        };

        self.state = SwapchainState::Recreating;
        self.context.wait_idle()?;
        self.destroy_attachments();

        self.build(config, render_pass)?;
        Ok(true)
    }

    fn build(&mut self, config: SwapchainConfig, render_pass: &RenderPass) -> Result<()> {
        if config.surface_format.format != render_pass.color_format() {
            anyhow::bail!(
                "Surface format changed from {:?} to {:?}",
                render_pass.color_format(),
                config.surface_format.format
            );
        }

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.present_mode
        );

        let old_swapchain = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = &self.context.swapchain_loader;
        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // The old swapchain may only go once its replacement exists
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(old_swapchain, None) };
        }
        self.handle = handle;
        self.config = config;

        self.images = unsafe { loader.get_swapchain_images(handle) }
            .context("Failed to get swapchain images")?;

        log::info!("Created swapchain with {} images", self.images.len());

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(config.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.context.device.create_image_view(&view_info, None) }
                .context("Failed to create swapchain image view")?;
            self.image_views.push(view);
        }

        let depth = GpuImage::depth_buffer(&self.context, config.extent)?;
        self.framebuffers = create_framebuffers(
            &self.context.device,
            &self.image_views,
            depth.view,
            render_pass.handle,
            config.extent,
        )?;
        self.depth = Some(depth);

        self.state = SwapchainState::Ready;
        Ok(())
    }

    fn destroy_attachments(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.context.device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                self.context.device.destroy_image_view(view, None);
            }
        }
        self.depth = None;
        self.images.clear();
    }

    /// Acquire the next image, signalling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.context.swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Queue `image_index` for presentation once `wait` is signaled
    pub fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.context
                .swapchain_loader
                .queue_present(self.context.graphics_queue, &present_info)
        }
    }

    pub fn mark_stale(&mut self) {
        self.state = self.state.marked_stale();
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_attachments();
        unsafe {
            self.context
                .swapchain_loader
                .destroy_swapchain(self.handle, None);
        }
        self.state = SwapchainState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn support(current: (u32, u32)) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: current.0,
                    height: current.1,
                },
                min_image_extent: vk::Extent2D {
                    width: 16,
                    height: 16,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    const REQUESTED: vk::Extent2D = vk::Extent2D {
        width: 1280,
        height: 720,
    };

    #[test]
    fn negotiation_is_idempotent() {
        let support = support((u32::MAX, u32::MAX));
        let first = SwapchainConfig::negotiate(&support, REQUESTED, vk::PresentModeKHR::MAILBOX);
        let second = SwapchainConfig::negotiate(&support, REQUESTED, vk::PresentModeKHR::MAILBOX);
        assert!(first.is_some());
        assert_eq!(first, second);

        let config = first.unwrap();
        assert_eq!(config.surface_format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.extent, REQUESTED);
        assert_eq!(config.image_count, 3);
    }

    #[test]
    fn surface_extent_wins_when_fixed() {
        let support = support((800, 600));
        let config =
            SwapchainConfig::negotiate(&support, REQUESTED, vk::PresentModeKHR::MAILBOX).unwrap();
        assert_eq!(
            config.extent,
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn requested_extent_is_clamped() {
        let support = support((u32::MAX, u32::MAX));
        let extent = choose_extent(
            &support.capabilities,
            vk::Extent2D {
                width: 8,
                height: 10_000,
            },
        );
        assert_eq!(
            extent,
            vk::Extent2D {
                width: 16,
                height: 4096
            }
        );
    }

    #[test]
    fn minimized_surface_declines() {
        let support = support((0, 0));
        assert_eq!(
            SwapchainConfig::negotiate(&support, REQUESTED, vk::PresentModeKHR::MAILBOX),
            None
        );
    }

    #[test]
    fn format_preference_order() {
        let srgb_rgba = format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let unorm = format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        assert_eq!(choose_surface_format(&[unorm, srgb_rgba]), Some(srgb_rgba));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let only_fifo = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&only_fifo, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(
                &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO],
                vk::PresentModeKHR::IMMEDIATE
            ),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn unbounded_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn only_a_built_swapchain_goes_stale() {
        use SwapchainState::*;
        assert_eq!(Ready.marked_stale(), Stale);
        assert_eq!(Stale.marked_stale(), Stale);
        assert_eq!(Recreating.marked_stale(), Recreating);
        assert_eq!(Destroyed.marked_stale(), Destroyed);

        let due: Vec<SwapchainState> = [Uninitialized, Ready, Stale, Recreating, Destroyed]
            .into_iter()
            .filter(|state| state.needs_rebuild())
            .collect();
        assert_eq!(due, vec![Stale, Recreating]);
    }
}
