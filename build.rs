// Build script to compile the mesh shaders from GLSL to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[(&str, &str)] = &[
    ("shaders/mesh.vert", "shaders/mesh.vert.spv"),
    ("shaders/mesh.frag", "shaders/mesh.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/mesh.vert");
    println!("cargo:rerun-if-changed=shaders/mesh.frag");

    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // glslc ships with the Vulkan SDK
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.3")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({e}); {input} was not compiled");
            println!("cargo:warning=compile it manually: glslc {input} -o {output}");
        }
    }
}
