// Vulkan backend - frame orchestration
//
// Owns the swapchain, frames in flight and the mesh pipeline, and turns the
// scene's models into draw calls each frame.
//
// IMPORTANT: Field order matters for Drop! Frame slots and the swapchain go
// before the render pass and surface; the window outlives the surface.

use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use bevy_ecs::entity::Entity;
use glam::Mat4;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use winit::window::Window;

use crate::assets::{self, MaterialData, ModelData};
use crate::backend::buffer::{BufferUsage, GpuBuffer};
use crate::backend::command::{self, CommandPool};
use crate::backend::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWrites};
use crate::backend::image::DEPTH_FORMAT;
use crate::backend::pipeline::{
    GraphicsPipelineBuilder, Pipeline, PipelineCache, PipelineLayout, PipelineLayoutBuilder,
    RenderPass,
};
use crate::backend::shader::ShaderModule;
use crate::backend::swapchain::{SurfaceSupport, Swapchain, SwapchainConfig};
use crate::backend::{GraphicsContext, Surface};
use crate::config::Config;
use crate::engine::Event;
use crate::scene::{Camera, Scene, Transform};

use super::components::{
    track_model_removal, ImageCache, ImageKey, Material, Mesh, Model, RenderOptions,
    RetiredModels,
};
use super::frame::{
    classify_acquire, classify_present, AcquireOutcome, DeletionQueue, FramePacer, FrameSlot,
    FrameSteps, PresentOutcome,
};
use super::uniforms::{bindings, DynamicMatrices, MaterialBuffer, StaticMatrices, Vertex};
use super::{GraphicsApi, RenderBackend};

/// Color textures are authored in sRGB
const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct VulkanBackend {
    pacer: FramePacer,
    pipeline: MeshPipeline,
    targets: FrameTargets,
    writes: DescriptorWrites,
    mipmaps: bool,
    quit: bool,
}

/// Swapchain-facing state driven by the frame pacer
struct FrameTargets {
    /// Meshes of removed models, freed once their last frame has retired
    retired: DeletionQueue<Vec<Mesh>>,
    /// Frames submitted so far
    submitted: u64,
    frames: Vec<FrameSlot>,
    command_pool: CommandPool,
    swapchain: Swapchain,
    render_pass: RenderPass,
    surface: Surface,
    window: Arc<Window>,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    minimized: bool,
    context: Arc<GraphicsContext>,
}

/// The single pipeline every mesh is drawn with
struct MeshPipeline {
    pipeline: Pipeline,
    layout: PipelineLayout,
    descriptor_layout: DescriptorSetLayout,
    _cache: PipelineCache,
}

impl VulkanBackend {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device and surface
        // ─────────────────────────────────────────────────────────────────────
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let (context, surface) =
            GraphicsContext::new(&config.window.title, enable_validation, &*window)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain and render pass
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let present_mode = config.get_present_mode();
        let support = SurfaceSupport::query(&context, surface.handle)?;
        let swapchain_config = SwapchainConfig::negotiate(
            &support,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            present_mode,
        )
        .context("Window has no drawable area")?;

        let render_pass =
            RenderPass::new(&context, swapchain_config.surface_format.format, DEPTH_FORMAT)?;
        let swapchain = Swapchain::new(&context, surface.handle, swapchain_config, &render_pass)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Frames in flight
        // ─────────────────────────────────────────────────────────────────────
        let frames_in_flight = config.graphics.max_frames_in_flight.max(1);
        let command_pool = CommandPool::new(&context)?;
        let frames = command_pool
            .allocate(frames_in_flight as u32)?
            .into_iter()
            .map(|cmd| FrameSlot::new(&context, cmd, size_of::<MaterialBuffer>() as u64))
            .collect::<Result<Vec<_>>>()?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Mesh pipeline
        // ─────────────────────────────────────────────────────────────────────
        let pipeline = MeshPipeline::new(&context, &render_pass, &config.assets.shader_dir)?;

        log::info!(
            "Vulkan initialized successfully! ({} frames in flight)",
            frames_in_flight
        );

        Ok(Self {
            pacer: FramePacer::new(frames_in_flight),
            pipeline,
            targets: FrameTargets {
                retired: DeletionQueue::new(frames_in_flight),
                submitted: 0,
                frames,
                command_pool,
                swapchain,
                render_pass,
                surface,
                window,
                present_mode,
                clear_color: config.graphics.clear_color,
                minimized: false,
                context,
            },
            writes: DescriptorWrites::new(),
            mipmaps: config.graphics.mipmaps,
            quit: false,
        })
    }

    fn context(&self) -> &Arc<GraphicsContext> {
        &self.targets.context
    }

    /// Block until no frame in flight can still be reading scene resources
    fn wait_for_frames(&self) -> Result<()> {
        assert!(
            self.pacer.recording().is_none(),
            "models cannot change while a frame is being recorded"
        );
        for frame in &self.targets.frames {
            frame.in_flight.wait()?;
        }
        Ok(())
    }

    /// Hand models removed from the scene to the deletion queue
    fn collect_retired(&mut self, scene: &mut Scene) {
        let RetiredModels { meshes, materials } = match scene.resource_mut::<RetiredModels>() {
            Some(mut retired) => std::mem::take(&mut *retired),
            None => return,
        };
        for material in materials {
            scene.despawn(material);
        }
        if !meshes.is_empty() {
            log::debug!(
                "Retiring {} meshes after frame {}",
                meshes.len(),
                self.targets.submitted
            );
            self.targets.retired.push(meshes, self.targets.submitted);
        }
    }

    fn upload_mesh(&self, data: &assets::MeshData, material: Entity, name: &str) -> Result<Mesh> {
        let vertex_buffer = GpuBuffer::with_data(
            self.context(),
            BufferUsage::Vertex,
            &data.vertices,
            &format!("{} vertices", name),
        )?;
        let index_buffer = GpuBuffer::with_data(
            self.context(),
            BufferUsage::Index,
            &data.indices,
            &format!("{} indices", name),
        )?;

        Ok(Mesh {
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
            material,
            local_transform: Mat4::IDENTITY,
        })
    }
}

fn load_material(cache: &mut ImageCache, data: &MaterialData) -> Result<Material> {
    let mut texture = |path: &Option<PathBuf>| -> Result<Option<ImageKey>> {
        match path {
            Some(path) => cache.load(path, TEXTURE_FORMAT),
            None => Ok(None),
        }
    };

    Ok(Material {
        ambient: data.ambient.into(),
        diffuse: data.diffuse.into(),
        specular: data.specular.into(),
        emission: data.emission.into(),
        shininess: data.shininess,
        opacity: data.opacity,
        ambient_texture: texture(&data.ambient_texture)?,
        diffuse_texture: texture(&data.diffuse_texture)?,
        specular_texture: texture(&data.specular_texture)?,
        emission_texture: texture(&data.emission_texture)?,
    })
}

impl MeshPipeline {
    fn new(
        context: &Arc<GraphicsContext>,
        render_pass: &RenderPass,
        shader_dir: &Path,
    ) -> Result<Self> {
        let vertex_shader = ShaderModule::load(context, &shader_dir.join("mesh.vert.spv"))?;
        let fragment_shader = ShaderModule::load(context, &shader_dir.join("mesh.frag.spv"))?;

        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let descriptor_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(bindings::STATIC_MATRICES, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(bindings::MATERIAL, fragment)
            .combined_image_sampler(bindings::AMBIENT_TEXTURE, fragment)
            .combined_image_sampler(bindings::DIFFUSE_TEXTURE, fragment)
            .combined_image_sampler(bindings::SPECULAR_TEXTURE, fragment)
            .combined_image_sampler(bindings::EMISSION_TEXTURE, fragment)
            .combined_image_sampler(bindings::ENVIRONMENT_TEXTURE, fragment)
            .push_descriptor()
            .build(context)
            .context("Failed to create mesh descriptor layout")?;

        let layout = PipelineLayoutBuilder::new()
            .set_layout(descriptor_layout.handle)
            .push_constant(
                vk::ShaderStageFlags::VERTEX,
                0,
                size_of::<DynamicMatrices>() as u32,
            )
            .build(context)
            .context("Failed to create mesh pipeline layout")?;

        let cache = PipelineCache::new(context)?;

        let pipeline = GraphicsPipelineBuilder::new()
            .vertex_shader(vertex_shader.handle)
            .fragment_shader(fragment_shader.handle)
            .vertex_input(&Vertex::binding_descriptions(), &Vertex::attribute_descriptions())
            .render_pass(render_pass.handle)
            .layout(layout.handle)
            .cull_mode(vk::CullModeFlags::BACK)
            .depth_test(true)
            .build(context, &cache)
            .context("Failed to create mesh pipeline")?;

        Ok(Self {
            pipeline,
            layout,
            descriptor_layout,
            _cache: cache,
        })
    }
}

impl FrameSteps for FrameTargets {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].in_flight.wait()?;
        let freed = self.retired.collect(self.submitted);
        if freed > 0 {
            log::debug!("Freed {} retired mesh batches", freed);
        }
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frames[slot].image_available.handle;
        classify_acquire(self.swapchain.acquire_next_image(semaphore))
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].in_flight.reset()
    }

    fn begin_recording(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = &mut self.frames[slot];
        frame.materials.rewind();

        let device = &self.context.device;
        let cmd = frame.command_buffer;
        command::begin_recording(device, cmd)?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass.handle)
            .framebuffer(self.swapchain.framebuffer(image_index))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    fn finish_and_submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames[slot];
        let device = &self.context.device;
        let cmd = frame.command_buffer;

        unsafe {
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        let wait_semaphores = [frame.image_available.handle];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            device
                .queue_submit(
                    self.context.graphics_queue,
                    &[submit_info],
                    frame.in_flight.handle, // Signal this fence when GPU is done
                )
                .context("Failed to submit frame")?;
        }
        self.submitted += 1;
        Ok(())
    }

    fn present_image(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait = self.frames[slot].render_finished.handle;
        classify_present(self.swapchain.present(image_index, wait))
    }

    fn swapchain_stale(&self) -> bool {
        self.swapchain.state().needs_rebuild()
    }

    fn mark_swapchain_stale(&mut self) {
        self.swapchain.mark_stale();
    }

    fn recreate_swapchain(&mut self) -> Result<bool> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.minimized = true;
            return Ok(false);
        }

        let recreated = self.swapchain.recreate(
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            self.present_mode,
            &self.render_pass,
        )?;
        log::debug!("Swapchain {:?} after recreation", self.swapchain.state());
        self.minimized = !recreated;
        Ok(recreated)
    }
}

impl RenderBackend for VulkanBackend {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn on_init(&mut self, scene: &mut Scene) -> Result<()> {
        track_model_removal(&mut scene.world);
        scene.insert_resource(ImageCache::new(self.context(), self.mipmaps)?);
        scene.insert_resource(RenderOptions {
            clear_color: self.targets.clear_color,
            environment: None,
        });

        if !scene.has_active_camera() {
            let transform = Transform::from_translation(glam::Vec3::new(0.0, 0.0, 5.0))
                .looking_at(glam::Vec3::ZERO, glam::Vec3::Y);
            scene.spawn_camera(transform, Camera::default());
        }
        Ok(())
    }

    fn on_event(&mut self, event: &Event) {
        match *event {
            Event::Resized { width, height } => {
                if width == 0 || height == 0 {
                    self.targets.minimized = true;
                } else {
                    self.targets.minimized = false;
                    self.targets.swapchain.mark_stale();
                }
            }
            Event::CloseRequested => self.quit = true,
            Event::KeyPressed(_) => {}
        }
    }

    fn begin_frame(&mut self) -> Result<bool> {
        if self.targets.minimized {
            return Ok(false);
        }
        self.pacer.begin(&mut self.targets)
    }

    fn render_scene(&mut self, scene: &mut Scene) -> Result<()> {
        let Some((slot, _)) = self.pacer.recording() else {
            panic!("render_scene called outside begin_frame/end_frame");
        };
        self.collect_retired(scene);

        if let Some(options) = scene.resource::<RenderOptions>() {
            self.targets.clear_color = options.clear_color;
        }

        let Some((camera_entity, camera)) = scene.get_active_camera() else {
            return Ok(());
        };

        // Aspect follows the swapchain so a resize never stretches the image
        let extent = self.targets.swapchain.extent();
        let proj = camera
            .with_aspect(extent.width, extent.height)
            .projection(GraphicsApi::Vulkan);
        let view = scene
            .get::<Transform>(camera_entity)
            .map(Transform::view_matrix)
            .unwrap_or(Mat4::IDENTITY);

        let context = &self.targets.context;
        let device = &context.device;
        let frame = &mut self.targets.frames[slot];
        let cmd = frame.command_buffer;
        let layout = self.pipeline.layout.handle;

        frame
            .static_matrices
            .write(0, &[StaticMatrices::new(proj, view)])?;

        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline.handle,
            );

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );
        }

        let world = &mut scene.world;
        let mut models = world.query::<(&Transform, &Model)>();
        let world = &*world;
        let images = world.get_resource::<ImageCache>();
        let environment = world
            .get_resource::<RenderOptions>()
            .and_then(|options| options.environment);

        for (transform, model) in models.iter(world) {
            let model_matrix = transform.matrix();

            for mesh in &model.meshes {
                let matrices =
                    DynamicMatrices::new(model_matrix * mesh.local_transform, view, proj);
                let material = world
                    .get::<Material>(mesh.material)
                    .cloned()
                    .unwrap_or_default();
                let material_info = frame
                    .materials
                    .push(&material.uniform(environment.is_some()))?;

                self.writes.clear();
                self.writes
                    .uniform_buffer(
                        bindings::STATIC_MATRICES,
                        frame.static_matrices.handle,
                        0,
                        size_of::<StaticMatrices>() as u64,
                    )
                    .uniform_buffer(
                        bindings::MATERIAL,
                        material_info.buffer,
                        material_info.offset,
                        material_info.range,
                    );

                if let Some(images) = images {
                    for (binding, key) in material.textures() {
                        if let Some(key) = key {
                            self.writes
                                .combined_image(binding, images.get(key).view, images.sampler());
                        }
                    }
                    if let Some(key) = environment {
                        self.writes.combined_image(
                            bindings::ENVIRONMENT_TEXTURE,
                            images.get(key).view,
                            images.sampler(),
                        );
                    }
                }

                self.writes.push(context, cmd, layout, 0);

                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        layout,
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::bytes_of(&matrices),
                    );
                    device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer.handle], &[0]);
                    device.cmd_bind_index_buffer(
                        cmd,
                        mesh.index_buffer.handle,
                        0,
                        vk::IndexType::UINT32,
                    );
                    device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
                }
            }
        }

        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        self.pacer.end(&mut self.targets)
    }

    fn set_environment_texture(&mut self, scene: &mut Scene, path: &Path) -> Result<()> {
        let mut cache = scene
            .resource_mut::<ImageCache>()
            .context("Image cache missing, on_init has not run")?;
        let Some(key) = cache.load(path, TEXTURE_FORMAT)? else {
            return Ok(());
        };

        if let Some(mut options) = scene.resource_mut::<RenderOptions>() {
            options.environment = Some(key);
        }
        Ok(())
    }

    fn load_model(&mut self, scene: &mut Scene, entity: Entity, path: &Path) -> Result<bool> {
        let Some(data) = assets::load_model_data(path) else {
            return Ok(false);
        };
        let ModelData {
            meshes, materials, ..
        } = data;

        // Textures first, while the cache is borrowed
        let materials = {
            let mut cache = scene
                .resource_mut::<ImageCache>()
                .context("Image cache missing, on_init has not run")?;
            materials
                .iter()
                .map(|m| load_material(&mut cache, m))
                .collect::<Result<Vec<_>>>()?
        };

        // The old model may still be read by frames in flight
        if scene.get::<Model>(entity).is_some() {
            self.unload_model(scene, entity)?;
        }

        let mut material_entities: Vec<Entity> = materials
            .into_iter()
            .map(|material| scene.world.spawn(material).id())
            .collect();

        let mut default_material = None;
        let mut gpu_meshes = Vec::with_capacity(meshes.len());
        for (i, mesh) in meshes.iter().enumerate() {
            let material = match mesh.material {
                Some(index) => material_entities[index],
                None => *default_material.get_or_insert_with(|| {
                    let entity = scene.world.spawn(Material::default()).id();
                    material_entities.push(entity);
                    entity
                }),
            };
            let name = format!("{}#{}", path.display(), i);
            gpu_meshes.push(self.upload_mesh(mesh, material, &name)?);
        }

        let mut entity_mut = scene
            .world
            .get_entity_mut(entity)
            .with_context(|| format!("Entity {:?} does not exist", entity))?;
        if !entity_mut.contains::<Transform>() {
            entity_mut.insert(Transform::default());
        }
        entity_mut.insert(Model {
            meshes: gpu_meshes,
            materials: material_entities,
            source: path.to_path_buf(),
        });

        Ok(true)
    }

    fn unload_model(&mut self, scene: &mut Scene, entity: Entity) -> Result<()> {
        let Some(source) = scene.get::<Model>(entity).map(|model| model.source.clone()) else {
            return Ok(());
        };
        if let Some(mut entity_mut) = scene.world.get_entity_mut(entity) {
            entity_mut.remove::<Model>();
        }
        self.collect_retired(scene);

        // An explicit unload frees its memory now instead of frames later
        self.wait_for_frames()?;
        self.targets.retired.flush();

        log::info!("Unloaded model {}", source.display());
        Ok(())
    }

    fn should_quit(&self) -> bool {
        self.quit
    }

    fn stop(&mut self) {
        self.quit = true;
    }

    fn primary_framebuffer_handle(&self) -> Option<u64> {
        self.pacer
            .recording()
            .map(|(_, image)| self.targets.swapchain.framebuffer(image).as_raw())
    }

    fn is_minimized(&self) -> bool {
        self.targets.minimized
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be destroyed while the GPU still executes it
        if let Err(e) = self.context().wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
    }
}
