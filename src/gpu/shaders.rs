//! Embedded compute programs and their include resolution
//!
//! Every program is embedded at compile time. `#include "name"` lines are resolved
//! against the embedded snippets plus two generated includes: the noise shaping
//! constants and the marching cubes tables, both produced from the Rust definitions
//! so host and device never disagree.

use std::borrow::Cow;
use std::fmt::Write as _;

use rustc_hash::FxHashSet;

use crate::constants::marching_cubes::ISO_LEVEL;
use crate::constants::noise_shape::{FEATURE_SIZE, HEIGHT_FALLOFF};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::tables::{CUBE_CORNERS, EDGE_CORNERS, EDGE_TABLE, TRIANGLE_TABLE};
use crate::gpu::ComputeProgram;

/// Uniform block struct and small helpers shared by every kernel
pub const CHUNK_PARAMS_WGSL: &str = include_str!("../shaders/chunk_params.wgsl");

/// Gradient noise used by the density kernel
pub const PERLIN_NOISE_WGSL: &str = include_str!("../shaders/perlin_noise.wgsl");

pub const NOISE_3D_WGSL: &str = include_str!("../shaders/noise3d.wgsl");
pub const NORMALS_WGSL: &str = include_str!("../shaders/normals.wgsl");
pub const ISOSURFACE_WGSL: &str = include_str!("../shaders/isosurface.wgsl");
pub const COPY_MESH_WGSL: &str = include_str!("../shaders/copy_mesh.wgsl");

/// Get shader include content by name
pub fn get_shader_include(name: &str) -> Option<Cow<'static, str>> {
    match name {
        "chunk_params.wgsl" => Some(Cow::Borrowed(CHUNK_PARAMS_WGSL)),
        "perlin_noise.wgsl" => Some(Cow::Borrowed(PERLIN_NOISE_WGSL)),
        "terrain_constants.wgsl" => Some(Cow::Owned(terrain_constants_wgsl())),
        "mc_tables.wgsl" => Some(Cow::Owned(marching_cubes_tables_wgsl())),
        _ => None,
    }
}

fn terrain_constants_wgsl() -> String {
    format!(
        "const ISO_LEVEL: f32 = {:?};\nconst FEATURE_SIZE: f32 = {:?};\nconst HEIGHT_FALLOFF: f32 = {:?};\n",
        ISO_LEVEL, FEATURE_SIZE, HEIGHT_FALLOFF
    )
}

/// Tables are module-scope `var<private>` arrays; naga rejects dynamic indexing
/// into `const` arrays on some backends.
fn marching_cubes_tables_wgsl() -> String {
    let mut out = String::with_capacity(32 * 1024);

    let corners: Vec<String> = CUBE_CORNERS
        .iter()
        .map(|[x, y, z]| format!("vec3<f32>({:?}, {:?}, {:?})", *x as f32, *y as f32, *z as f32))
        .collect();
    let _ = writeln!(
        out,
        "var<private> CUBE_CORNERS: array<vec3<f32>, 8> = array<vec3<f32>, 8>(\n    {}\n);",
        corners.join(",\n    ")
    );

    let edges: Vec<String> = EDGE_CORNERS
        .iter()
        .map(|[a, b]| format!("vec2<u32>({}u, {}u)", a, b))
        .collect();
    let _ = writeln!(
        out,
        "var<private> EDGE_CORNERS: array<vec2<u32>, 12> = array<vec2<u32>, 12>(\n    {}\n);",
        edges.join(",\n    ")
    );

    let _ = writeln!(
        out,
        "var<private> EDGE_TABLE: array<u32, 256> = array<u32, 256>(\n{}\n);",
        rows(EDGE_TABLE.iter().map(|v| format!("{:#x}u", v)), 16)
    );

    let _ = writeln!(
        out,
        "var<private> TRI_TABLE: array<i32, 4096> = array<i32, 4096>(\n{}\n);",
        rows(TRIANGLE_TABLE.iter().map(|v| v.to_string()), 16)
    );

    out
}

fn rows(values: impl Iterator<Item = String>, per_row: usize) -> String {
    let values: Vec<String> = values.collect();
    values
        .chunks(per_row)
        .map(|row| format!("    {}", row.join(", ")))
        .collect::<Vec<_>>()
        .join(",\n")
}

/// Resolve every `#include` directive of a program
///
/// Includes are expanded recursively; a snippet already expanded once is skipped.
pub fn preprocess(program: &str, source: &str) -> TerrainResult<String> {
    let mut seen = FxHashSet::default();
    expand(program, source, &mut seen)
}

fn expand(program: &str, source: &str, seen: &mut FxHashSet<String>) -> TerrainResult<String> {
    let mut result = String::with_capacity(source.len());

    for (index, line) in source.lines().enumerate() {
        let Some(include) = parse_include_directive(line) else {
            result.push_str(line);
            result.push('\n');
            continue;
        };

        if !seen.insert(include.to_string()) {
            let _ = writeln!(result, "// Skipped repeated include: {}", include);
            continue;
        }

        let content = get_shader_include(include).ok_or_else(|| TerrainError::ShaderParse {
            program: program.to_string(),
            line: index + 1,
            reason: format!("unknown include '{}'", include),
        })?;
        let processed = expand(program, &content, seen)?;

        let _ = writeln!(result, "// Begin include: {}", include);
        result.push_str(&processed);
        let _ = writeln!(result, "// End include: {}", include);
    }

    Ok(result)
}

fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("#include")?.trim();
    rest.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('<').and_then(|r| r.strip_suffix('>')))
}

/// The four shipped terrain programs, preprocessed and parsed
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    pub density: ComputeProgram,
    pub normals: ComputeProgram,
    pub isosurface: ComputeProgram,
    pub copy_mesh: ComputeProgram,
}

impl ShaderLibrary {
    pub fn builtin() -> TerrainResult<Self> {
        let load = |name: &str, source: &str| -> TerrainResult<ComputeProgram> {
            ComputeProgram::parse(name, preprocess(name, source)?)
        };
        Ok(Self {
            density: load("noise3d", NOISE_3D_WGSL)?,
            normals: load("normals", NORMALS_WGSL)?,
            isosurface: load("isosurface", ISOSURFACE_WGSL)?,
            copy_mesh: load("copy_mesh", COPY_MESH_WGSL)?,
        })
    }
}
