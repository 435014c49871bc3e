// Asset decoding
//
// Turns files on disk into plain vertex/pixel data. Nothing here touches
// the GPU; failures are logged and reported as absent.

use glam::Vec3;
use std::path::{Path, PathBuf};

use crate::render::uniforms::Vertex;

/// Decoded geometry of one mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Index into [`ModelData::materials`]
    pub material: Option<usize>,
}

/// Decoded material; texture paths are already resolved against the model directory
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialData {
    pub name: String,
    pub ambient: [f32; 3],
    pub diffuse: [f32; 3],
    pub specular: [f32; 3],
    pub emission: [f32; 3],
    pub shininess: f32,
    pub opacity: f32,
    pub ambient_texture: Option<PathBuf>,
    pub diffuse_texture: Option<PathBuf>,
    pub specular_texture: Option<PathBuf>,
    pub emission_texture: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
    pub base_directory: PathBuf,
}

/// Tightly packed 8-bit pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Load a Wavefront OBJ model (and its MTL materials)
pub fn load_model_data(path: &Path) -> Option<ModelData> {
    let (models, materials) = match tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::warn!("Failed to load model {}: {}", path.display(), e);
            return None;
        }
    };

    let base_directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let materials = match materials {
        Ok(materials) => materials,
        Err(e) => {
            log::warn!("Failed to load materials for {}: {}", path.display(), e);
            Vec::new()
        }
    };

    let materials = materials
        .iter()
        .map(|m| convert_material(m, &base_directory))
        .collect::<Vec<_>>();

    let meshes = models
        .into_iter()
        .map(|model| convert_mesh(model, materials.len()))
        .filter(|mesh| !mesh.indices.is_empty())
        .collect::<Vec<_>>();

    log::info!(
        "Loaded model {} ({} meshes, {} materials)",
        path.display(),
        meshes.len(),
        materials.len()
    );

    Some(ModelData {
        meshes,
        materials,
        base_directory,
    })
}

fn convert_mesh(model: tobj::Model, material_count: usize) -> MeshData {
    let mesh = model.mesh;
    let vertex_count = mesh.positions.len() / 3;

    let mut vertices: Vec<Vertex> = (0..vertex_count)
        .map(|i| {
            let position = [
                mesh.positions[3 * i],
                mesh.positions[3 * i + 1],
                mesh.positions[3 * i + 2],
            ];
            let normal = if mesh.normals.len() >= 3 * (i + 1) {
                [
                    mesh.normals[3 * i],
                    mesh.normals[3 * i + 1],
                    mesh.normals[3 * i + 2],
                ]
            } else {
                [0.0; 3]
            };
            // OBJ puts the texture origin bottom-left
            let uv = if mesh.texcoords.len() >= 2 * (i + 1) {
                [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
            } else {
                [0.0; 2]
            };
            Vertex {
                position,
                normal,
                uv,
            }
        })
        .collect();

    if mesh.normals.is_empty() {
        compute_normals(&mut vertices, &mesh.indices);
    }

    MeshData {
        name: model.name,
        vertices,
        indices: mesh.indices,
        material: mesh.material_id.filter(|&id| id < material_count),
    }
}

fn convert_material(material: &tobj::Material, base_directory: &Path) -> MaterialData {
    let texture = |name: &Option<String>| -> Option<PathBuf> {
        name.as_deref()
            .filter(|n| !n.is_empty())
            .map(|n| base_directory.join(n))
    };

    let emission = material
        .unknown_param
        .get("Ke")
        .and_then(|value| parse_color(value))
        .unwrap_or([0.0; 3]);
    let emission_texture = material
        .unknown_param
        .get("map_Ke")
        .map(|name| base_directory.join(name.trim()));

    MaterialData {
        name: material.name.clone(),
        ambient: material.ambient.unwrap_or([0.1; 3]),
        diffuse: material.diffuse.unwrap_or([0.8; 3]),
        specular: material.specular.unwrap_or([0.0; 3]),
        emission,
        shininess: material.shininess.unwrap_or(1.0),
        opacity: material.dissolve.unwrap_or(1.0),
        ambient_texture: texture(&material.ambient_texture),
        diffuse_texture: texture(&material.diffuse_texture),
        specular_texture: texture(&material.specular_texture),
        emission_texture,
    }
}

fn parse_color(value: &str) -> Option<[f32; 3]> {
    let mut parts = value.split_whitespace().map(str::parse::<f32>);
    let r = parts.next()?.ok()?;
    let g = parts.next()?.ok()?;
    let b = parts.next()?.ok()?;
    Some([r, g, b])
}

/// Area-weighted vertex normals for meshes that ship without any
fn compute_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let mut sums = vec![Vec3::ZERO; vertices.len()];

    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [
            triangle[0] as usize,
            triangle[1] as usize,
            triangle[2] as usize,
        ];
        if a >= vertices.len() || b >= vertices.len() || c >= vertices.len() {
            continue;
        }
        let pa = Vec3::from(vertices[a].position);
        let pb = Vec3::from(vertices[b].position);
        let pc = Vec3::from(vertices[c].position);
        let face = (pb - pa).cross(pc - pa);
        sums[a] += face;
        sums[b] += face;
        sums[c] += face;
    }

    for (vertex, sum) in vertices.iter_mut().zip(sums) {
        vertex.normal = sum.normalize_or_zero().to_array();
    }
}

/// Decode an image file into `channels` 8-bit channels (1, 2, 3 or 4)
pub fn load_texture_data(path: &Path, channels: u32) -> Option<TextureData> {
    let image = match image::open(path) {
        Ok(image) => image,
        Err(e) => {
            log::warn!("Failed to load texture {}: {}", path.display(), e);
            return None;
        }
    };

    let (width, height) = (image.width(), image.height());
    let pixels = match channels {
        1 => image.into_luma8().into_raw(),
        2 => image.into_luma_alpha8().into_raw(),
        3 => image.into_rgb8().into_raw(),
        4 => image.into_rgba8().into_raw(),
        other => {
            log::warn!("Unsupported channel count {} for {}", other, path.display());
            return None;
        }
    };

    Some(TextureData {
        pixels,
        width,
        height,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CUBE_FACE_OBJ: &str = "\
mtllib quad.mtl
o quad
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
usemtl painted
f 1/1 2/2 3/3
f 1/1 3/3 4/4
";

    const QUAD_MTL: &str = "\
newmtl painted
Ka 0.2 0.2 0.2
Kd 0.5 0.25 1.0
Ks 1.0 1.0 1.0
Ns 16.0
Ke 0.1 0.2 0.3
map_Kd textures/albedo.png
map_Ke glow.png
";

    #[test]
    fn loads_obj_with_materials() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quad.obj"), CUBE_FACE_OBJ).unwrap();
        fs::write(dir.path().join("quad.mtl"), QUAD_MTL).unwrap();

        let model = load_model_data(&dir.path().join("quad.obj")).unwrap();
        assert_eq!(model.base_directory, dir.path());
        assert_eq!(model.meshes.len(), 1);
        assert_eq!(model.materials.len(), 1);

        let mesh = &model.meshes[0];
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.material, Some(0));
        // Flipped V
        assert!(mesh.vertices.iter().any(|v| v.uv == [0.0, 1.0]));
        // Normals computed for a flat quad facing +Z
        for vertex in &mesh.vertices {
            assert_eq!(vertex.normal, [0.0, 0.0, 1.0]);
        }

        let material = &model.materials[0];
        assert_eq!(material.diffuse, [0.5, 0.25, 1.0]);
        assert_eq!(material.shininess, 16.0);
        assert_eq!(material.emission, [0.1, 0.2, 0.3]);
        assert_eq!(
            material.diffuse_texture,
            Some(dir.path().join("textures/albedo.png"))
        );
        assert_eq!(material.emission_texture, Some(dir.path().join("glow.png")));
        assert_eq!(material.ambient_texture, None);
    }

    #[test]
    fn missing_model_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model_data(&dir.path().join("nope.obj")).is_none());
    }

    #[test]
    fn missing_mtl_keeps_geometry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quad.obj"), CUBE_FACE_OBJ).unwrap();

        let model = load_model_data(&dir.path().join("quad.obj")).unwrap();
        assert!(model.materials.is_empty());
        assert_eq!(model.meshes[0].material, None);
    }

    #[test]
    fn decodes_png_to_requested_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        let image = image::RgbImage::from_fn(4, 2, |x, _| {
            if x % 2 == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        image.save(&path).unwrap();

        let rgba = load_texture_data(&path, 4).unwrap();
        assert_eq!((rgba.width, rgba.height, rgba.channels), (4, 2, 4));
        assert_eq!(rgba.pixels.len(), 4 * 2 * 4);
        assert_eq!(&rgba.pixels[..4], &[255, 0, 0, 255]);

        let gray = load_texture_data(&path, 1).unwrap();
        assert_eq!(gray.pixels.len(), 8);
    }

    #[test]
    fn unreadable_texture_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not a png").unwrap();
        assert!(load_texture_data(&path, 4).is_none());
    }

    #[test]
    fn color_parsing() {
        assert_eq!(parse_color("1 0.5 0"), Some([1.0, 0.5, 0.0]));
        assert_eq!(parse_color("1 x 0"), None);
        assert_eq!(parse_color("1"), None);
    }
}
