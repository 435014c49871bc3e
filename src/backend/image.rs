// Images: allocation, layout tracking, uploads and mipmap generation
//
// Every command touching an image is issued in the layout it requires.
// Layouts are tracked per mip level and changed only through barriers
// whose masks come from one fixed table.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::{BufferUsage, GpuBuffer};
use super::GraphicsContext;

/// Layouts an image can be tracked in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    ColorAttachment,
    DepthAttachment,
    PresentSrc,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Access and stage masks for one layout transition barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier masks for `old -> new`, `None` if the pair is not supported
pub fn transition_masks(old: ImageLayout, new: ImageLayout) -> Option<TransitionMasks> {
    use ImageLayout::*;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (Undefined, TransferDst) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (TransferDst, ShaderReadOnly) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (TransferDst, TransferSrc) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (TransferSrc, ShaderReadOnly) => (
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (Undefined, DepthAttachment) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => return None,
    };

    Some(TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Barrier masks for a transition the renderer relies on.
///
/// # Panics
/// If the pair is not in the transition table. Issuing an unknown
/// transition is a bug in the caller, not a runtime condition.
pub fn barrier_masks(old: ImageLayout, new: ImageLayout) -> TransitionMasks {
    match transition_masks(old, new) {
        Some(masks) => masks,
        None => panic!("Unsupported image layout transition: {:?} -> {:?}", old, new),
    }
}

/// Length of a full mip chain: `1 + floor(log2(max(w, h)))`
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// One step of uploading pixel data into an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    Transition {
        base_level: u32,
        level_count: u32,
        old: ImageLayout,
        new: ImageLayout,
    },
    /// Copy the staging buffer into mip level 0
    CopyBuffer,
    /// Downsample `src_level` into `src_level + 1`
    Blit {
        src_level: u32,
        src_extent: (i32, i32),
        dst_extent: (i32, i32),
    },
}

/// Command sequence for a staged upload of a `width`x`height` image with
/// `mip_levels` levels. Every level ends shader-read-only.
pub fn upload_steps(width: u32, height: u32, mip_levels: u32) -> Vec<UploadStep> {
    let mip_levels = mip_levels.max(1);
    let mut steps = vec![
        UploadStep::Transition {
            base_level: 0,
            level_count: mip_levels,
            old: ImageLayout::Undefined,
            new: ImageLayout::TransferDst,
        },
        UploadStep::CopyBuffer,
    ];

    let mut extent = (width as i32, height as i32);
    for level in 1..mip_levels {
        let next = ((extent.0 / 2).max(1), (extent.1 / 2).max(1));

        steps.push(UploadStep::Transition {
            base_level: level - 1,
            level_count: 1,
            old: ImageLayout::TransferDst,
            new: ImageLayout::TransferSrc,
        });
        steps.push(UploadStep::Blit {
            src_level: level - 1,
            src_extent: extent,
            dst_extent: next,
        });
        steps.push(UploadStep::Transition {
            base_level: level - 1,
            level_count: 1,
            old: ImageLayout::TransferSrc,
            new: ImageLayout::ShaderReadOnly,
        });

        extent = next;
    }

    steps.push(UploadStep::Transition {
        base_level: mip_levels - 1,
        level_count: 1,
        old: ImageLayout::TransferDst,
        new: ImageLayout::ShaderReadOnly,
    });

    steps
}

/// Per-mip-level layout state of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutTracker {
    levels: Vec<ImageLayout>,
}

impl LayoutTracker {
    pub fn new(mip_levels: u32) -> Self {
        Self {
            levels: vec![ImageLayout::Undefined; mip_levels.max(1) as usize],
        }
    }

    pub fn level(&self, level: u32) -> ImageLayout {
        self.levels[level as usize]
    }

    /// The layout shared by every level, `None` mid-chain
    pub fn common(&self) -> Option<ImageLayout> {
        let first = self.levels[0];
        self.levels.iter().all(|&l| l == first).then_some(first)
    }

    /// Record `old -> new` for a level range
    ///
    /// # Panics
    /// If any level in the range is not currently in `old`.
    pub fn apply(&mut self, base_level: u32, level_count: u32, old: ImageLayout, new: ImageLayout) {
        let range = base_level as usize..(base_level + level_count) as usize;
        assert!(
            range.end <= self.levels.len(),
            "Mip range {:?} outside image with {} levels",
            range,
            self.levels.len()
        );
        for level in range {
            assert_eq!(
                self.levels[level], old,
                "Mip level {} is in {:?}, expected {:?}",
                level, self.levels[level], old
            );
            self.levels[level] = new;
        }
    }
}

/// Creation parameters for a GPU image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub aspect: vk::ImageAspectFlags,
}

/// A 2D image with its memory, view and tracked layout
pub struct GpuImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    layouts: LayoutTracker,
    context: Arc<GraphicsContext>,
}

impl GpuImage {
    pub fn new(context: &Arc<GraphicsContext>, desc: &ImageDesc, name: &str) -> Result<Self> {
        let mip_levels = desc.mip_levels.max(1);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { context.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { context.device.get_image_memory_requirements(handle) };

        let allocation = context.with_allocator(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .with_context(|| format!("Failed to allocate memory for image '{}'", name))
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { context.device.destroy_image(handle, None) };
                return Err(e);
            }
        };

        let mut image = Self {
            handle,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            extent: desc.extent,
            format: desc.format,
            aspect: desc.aspect,
            layouts: LayoutTracker::new(mip_levels),
            context: context.clone(),
        };

        if let Some(allocation) = &image.allocation {
            unsafe {
                context
                    .device
                    .bind_image_memory(handle, allocation.memory(), allocation.offset())
            }
            .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(image.subresource_range(0, mip_levels));

        image.view = unsafe { context.device.create_image_view(&view_info, None) }
            .with_context(|| format!("Failed to create view for image '{}'", name))?;

        Ok(image)
    }

    /// Upload tightly packed pixels into a new sampled image
    ///
    /// With `mipmaps` the full chain is generated by blitting each level
    /// into the next. Formats that cannot be linearly filtered by the
    /// device fall back to a single level.
    pub fn from_pixels(
        context: &Arc<GraphicsContext>,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
        mipmaps: bool,
        name: &str,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * bytes_per_pixel(format)?;
        if pixels.len() != expected {
            anyhow::bail!(
                "Image '{}' has {} bytes of pixel data, expected {}",
                name,
                pixels.len(),
                expected
            );
        }

        let mip_levels = if !mipmaps {
            1
        } else if supports_linear_blit(context, format) {
            max_mip_levels(width, height)
        } else {
            log::warn!(
                "{:?} does not support linear blits, '{}' gets no mipmaps",
                format,
                name
            );
            1
        };

        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let staging = GpuBuffer::with_data(
            context,
            BufferUsage::Staging,
            pixels,
            &format!("{} (staging)", name),
        )?;

        let mut image = Self::new(
            context,
            &ImageDesc {
                extent: vk::Extent2D { width, height },
                format,
                usage,
                mip_levels,
                aspect: vk::ImageAspectFlags::COLOR,
            },
            name,
        )?;

        let steps = upload_steps(width, height, mip_levels);
        context.submit_one_time(|device, cmd| {
            for step in &steps {
                image.record_step(device, cmd, &staging, step);
            }
        })?;

        log::debug!(
            "Uploaded image '{}' ({}x{}, {} mip levels)",
            name,
            width,
            height,
            mip_levels
        );

        Ok(image)
    }

    /// Depth attachment matching `extent`, already in depth-attachment layout
    pub fn depth_buffer(context: &Arc<GraphicsContext>, extent: vk::Extent2D) -> Result<Self> {
        let mut image = Self::new(
            context,
            &ImageDesc {
                extent,
                format: DEPTH_FORMAT,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                mip_levels: 1,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
            "depth buffer",
        )?;
        image.transition(ImageLayout::DepthAttachment)?;
        Ok(image)
    }

    /// Move every level to `new` in a one-time submission
    pub fn transition(&mut self, new: ImageLayout) -> Result<()> {
        let levels = self.mip_levels();
        let context = self.context.clone();
        context.submit_one_time(|device, cmd| {
            self.record_transition(device, cmd, 0, levels, new);
        })
    }

    /// Record a layout barrier for a level range into `cmd`
    ///
    /// # Panics
    /// If the levels do not share one layout or the transition is unknown.
    pub fn record_transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        base_level: u32,
        level_count: u32,
        new: ImageLayout,
    ) {
        let old = self.layouts.level(base_level);
        let masks = barrier_masks(old, new);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old.to_vk())
            .new_layout(new.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(self.subresource_range(base_level, level_count))
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );
        }

        self.layouts.apply(base_level, level_count, old, new);
    }

    fn record_step(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        staging: &GpuBuffer,
        step: &UploadStep,
    ) {
        match *step {
            UploadStep::Transition {
                base_level,
                level_count,
                old,
                new,
            } => {
                assert_eq!(self.layouts.level(base_level), old);
                self.record_transition(device, cmd, base_level, level_count, new);
            }
            UploadStep::CopyBuffer => {
                assert_eq!(self.layouts.level(0), ImageLayout::TransferDst);

                let region = vk::BufferImageCopy::default()
                    .image_subresource(self.subresource_layers(0))
                    .image_extent(vk::Extent3D {
                        width: self.extent.width,
                        height: self.extent.height,
                        depth: 1,
                    });

                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.handle,
                        self.handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            UploadStep::Blit {
                src_level,
                src_extent,
                dst_extent,
            } => {
                assert_eq!(self.layouts.level(src_level), ImageLayout::TransferSrc);
                assert_eq!(self.layouts.level(src_level + 1), ImageLayout::TransferDst);

                let blit = vk::ImageBlit::default()
                    .src_subresource(self.subresource_layers(src_level))
                    .src_offsets([
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: src_extent.0,
                            y: src_extent.1,
                            z: 1,
                        },
                    ])
                    .dst_subresource(self.subresource_layers(src_level + 1))
                    .dst_offsets([
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: dst_extent.0,
                            y: dst_extent.1,
                            z: 1,
                        },
                    ]);

                unsafe {
                    device.cmd_blit_image(
                        cmd,
                        self.handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        self.handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
            }
        }
    }

    fn subresource_range(&self, base_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: base_level,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn subresource_layers(&self, level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Layout shared by all mip levels, `None` while levels differ
    pub fn layout(&self) -> Option<ImageLayout> {
        self.layouts.common()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.layouts.levels.len() as u32
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.context.device.destroy_image_view(self.view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            let freed = self
                .context
                .with_allocator(|allocator| allocator.free(allocation).map_err(Into::into));
            if let Err(e) = freed {
                log::warn!("Failed to free image memory: {:#}", e);
            }
        }
        unsafe {
            self.context.device.destroy_image(self.handle, None);
        }
    }
}

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

fn bytes_per_pixel(format: vk::Format) -> Result<usize> {
    match format {
        vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM => Ok(4),
        vk::Format::R8_UNORM => Ok(1),
        other => anyhow::bail!("Unsupported upload format {:?}", other),
    }
}

fn supports_linear_blit(context: &GraphicsContext, format: vk::Format) -> bool {
    let properties = unsafe {
        context
            .instance
            .get_physical_device_format_properties(context.physical_device, format)
    };
    properties.optimal_tiling_features.contains(
        vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST,
    )
}

/// Linear, repeating sampler with unclamped LOD
pub struct Sampler {
    pub handle: vk::Sampler,
    context: Arc<GraphicsContext>,
}

impl Sampler {
    pub fn new(context: &Arc<GraphicsContext>) -> Result<Self> {
        let anisotropy = context.sampler_anisotropy;
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy {
                context.properties.limits.max_sampler_anisotropy
            } else {
                1.0
            })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        let handle = unsafe { context.device.create_sampler(&info, None) }
            .context("Failed to create sampler")?;

        Ok(Self {
            handle,
            context: context.clone(),
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_sampler(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays an upload plan against a tracker, checking each command's
    /// required layouts the same way recording does.
    fn replay(width: u32, height: u32, mip_levels: u32) -> LayoutTracker {
        let mut tracker = LayoutTracker::new(mip_levels);
        for step in upload_steps(width, height, mip_levels) {
            match step {
                UploadStep::Transition {
                    base_level,
                    level_count,
                    old,
                    new,
                } => {
                    barrier_masks(old, new);
                    tracker.apply(base_level, level_count, old, new);
                }
                UploadStep::CopyBuffer => {
                    assert_eq!(tracker.level(0), ImageLayout::TransferDst);
                }
                UploadStep::Blit { src_level, .. } => {
                    assert_eq!(tracker.level(src_level), ImageLayout::TransferSrc);
                    assert_eq!(tracker.level(src_level + 1), ImageLayout::TransferDst);
                }
            }
        }
        tracker
    }

    #[test]
    fn mip_level_formula() {
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(2, 1), 2);
        assert_eq!(max_mip_levels(512, 512), 10);
        assert_eq!(max_mip_levels(1024, 768), 11);
        assert_eq!(max_mip_levels(300, 17), 9);
        assert_eq!(max_mip_levels(0, 0), 1);
    }

    #[test]
    fn full_chain_ends_shader_read_only() {
        let tracker = replay(512, 512, max_mip_levels(512, 512));
        assert_eq!(tracker.levels.len(), 10);
        assert_eq!(tracker.common(), Some(ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn single_level_upload() {
        let steps = upload_steps(64, 32, 1);
        assert_eq!(
            steps,
            vec![
                UploadStep::Transition {
                    base_level: 0,
                    level_count: 1,
                    old: ImageLayout::Undefined,
                    new: ImageLayout::TransferDst,
                },
                UploadStep::CopyBuffer,
                UploadStep::Transition {
                    base_level: 0,
                    level_count: 1,
                    old: ImageLayout::TransferDst,
                    new: ImageLayout::ShaderReadOnly,
                },
            ]
        );
        assert_eq!(
            replay(64, 32, 1).common(),
            Some(ImageLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn non_square_chain_clamps_to_one() {
        let steps = upload_steps(8, 2, max_mip_levels(8, 2));
        let blits: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                UploadStep::Blit { dst_extent, .. } => Some(*dst_extent),
                _ => None,
            })
            .collect();
        assert_eq!(blits, vec![(4, 1), (2, 1), (1, 1)]);
        assert_eq!(
            replay(8, 2, 4).common(),
            Some(ImageLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn mid_chain_layout_is_mixed() {
        let mut tracker = LayoutTracker::new(3);
        tracker.apply(0, 3, ImageLayout::Undefined, ImageLayout::TransferDst);
        tracker.apply(0, 1, ImageLayout::TransferDst, ImageLayout::TransferSrc);
        assert_eq!(tracker.common(), None);
        assert_eq!(tracker.level(0), ImageLayout::TransferSrc);
        assert_eq!(tracker.level(2), ImageLayout::TransferDst);
    }

    #[test]
    fn every_used_transition_is_in_the_table() {
        use ImageLayout::*;
        let used = [
            (Undefined, TransferDst),
            (TransferDst, ShaderReadOnly),
            (TransferDst, TransferSrc),
            (TransferSrc, ShaderReadOnly),
            (Undefined, DepthAttachment),
        ];
        for (old, new) in used {
            assert!(transition_masks(old, new).is_some(), "{:?} -> {:?}", old, new);
        }

        let depth = barrier_masks(Undefined, DepthAttachment);
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    #[should_panic(expected = "Unsupported image layout transition")]
    fn unlisted_transition_panics() {
        barrier_masks(ImageLayout::ShaderReadOnly, ImageLayout::PresentSrc);
    }

    #[test]
    #[should_panic(expected = "expected Undefined")]
    fn mismatched_tracked_layout_panics() {
        let mut tracker = LayoutTracker::new(1);
        tracker.apply(0, 1, ImageLayout::Undefined, ImageLayout::TransferDst);
        tracker.apply(0, 1, ImageLayout::Undefined, ImageLayout::TransferDst);
    }

    #[test]
    fn upload_formats() {
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8A8_SRGB).unwrap(), 4);
        assert!(bytes_per_pixel(vk::Format::R32G32B32_SFLOAT).is_err());
    }
}
