// Build script: compile the demo's GLSL shaders to SPIR-V when glslc is on PATH

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/triangle.vert", "shaders/triangle.frag"];

fn main() {
    for shader in SHADERS {
        println!("cargo:rerun-if-changed={}", shader);
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    if !Path::new(input).exists() {
        println!("cargo:warning=missing shader source {}", input);
        return;
    }

    match Command::new("glslc").arg(input).arg("-o").arg(output).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!("cargo:warning=glslc failed on {} ({:?})", input, status.code());
        }
        Err(_) => {
            // The library does not need the shaders; only the demo loads them.
            println!("cargo:warning=glslc not found, run: glslc {} -o {}", input, output);
        }
    }
}
