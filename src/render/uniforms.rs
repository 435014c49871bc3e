// GPU-visible data layouts
//
// These structs are copied byte-for-byte into uniform buffers, push
// constants and vertex buffers, so they must match the std140 blocks in
// shaders/mesh.vert and shaders/mesh.frag exactly.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::mem::{offset_of, size_of};

/// Per-frame camera matrices (binding 0)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct StaticMatrices {
    pub proj: Mat4,
    pub view: Mat4,
    pub view_proj: Mat4,
}

impl StaticMatrices {
    pub fn new(proj: Mat4, view: Mat4) -> Self {
        Self {
            proj,
            view,
            view_proj: proj * view,
        }
    }
}

/// Per-draw material values (binding 1)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialBuffer {
    pub ambient: Vec4,
    pub diffuse: Vec4,
    /// `w` carries the specular exponent
    pub specular: Vec4,
    pub emission: Vec4,
    pub has_ambient_tex: i32,
    pub has_diffuse_tex: i32,
    pub has_specular_tex: i32,
    pub has_emission_tex: i32,
}

/// Per-draw transforms, pushed as push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DynamicMatrices {
    pub model: Mat4,
    pub model_view: Mat4,
    pub mvp: Mat4,
    pub normal: Mat4,
}

impl DynamicMatrices {
    pub fn new(model: Mat4, view: Mat4, proj: Mat4) -> Self {
        let model_view = view * model;
        Self {
            model,
            model_view,
            mvp: proj * model_view,
            normal: model_view.inverse().transpose(),
        }
    }
}

/// Interleaved mesh vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, normal) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// Descriptor bindings of the mesh pipeline's push set
pub mod bindings {
    pub const STATIC_MATRICES: u32 = 0;
    pub const MATERIAL: u32 = 1;
    pub const AMBIENT_TEXTURE: u32 = 2;
    pub const DIFFUSE_TEXTURE: u32 = 3;
    pub const SPECULAR_TEXTURE: u32 = 4;
    pub const EMISSION_TEXTURE: u32 = 5;
    pub const ENVIRONMENT_TEXTURE: u32 = 6;
}

/// Round `size` up to a multiple of `alignment` (a power of two)
pub fn align_up(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}
