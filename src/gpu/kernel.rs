//! Compute programs and kernel resolution
//!
//! A [`ComputeProgram`] is WGSL source scanned for its compute entry points and its
//! `@group(0) @binding(n)` resource declarations. The scan is line based: every
//! binding declaration and every `@workgroup_size` attribute must sit on one line,
//! which is how all shipped programs are written.

use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{ComputeDevice, KernelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAccess {
    Read,
    Write,
    ReadWrite,
}

impl StorageAccess {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" => Some(StorageAccess::Read),
            "write" => Some(StorageAccess::Write),
            "read_write" => Some(StorageAccess::ReadWrite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    StorageBuffer { read_only: bool },
    /// Sampled `texture_3d<f32>`, read with `textureLoad`
    Texture,
    StorageTexture { format: String, access: StorageAccess },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub binding: u32,
    pub name: String,
    pub kind: BindingKind,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub workgroup_size: [u32; 3],
    pub line: usize,
}

/// Parsed WGSL compute program
#[derive(Debug, Clone)]
pub struct ComputeProgram {
    pub name: String,
    pub source: String,
    pub entry_points: Vec<EntryPoint>,
    pub bindings: Vec<BindingInfo>,
}

impl ComputeProgram {
    pub fn parse(name: &str, source: impl Into<String>) -> TerrainResult<Self> {
        let source = source.into();
        let mut entry_points = Vec::new();
        let mut bindings: Vec<BindingInfo> = Vec::new();

        let mut pending_compute = false;
        let mut pending_size: Option<[u32; 3]> = None;

        for (index, raw_line) in source.lines().enumerate() {
            let line_no = index + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if line.contains("@binding(") {
                let info = parse_binding(name, line_no, line)?;
                if bindings.iter().any(|b| b.binding == info.binding) {
                    return Err(parse_error(
                        name,
                        line_no,
                        format!("binding {} declared twice", info.binding),
                    ));
                }
                if bindings.iter().any(|b| b.name == info.name) {
                    return Err(parse_error(
                        name,
                        line_no,
                        format!("resource '{}' declared twice", info.name),
                    ));
                }
                bindings.push(info);
                continue;
            }

            if line.contains("@compute") {
                pending_compute = true;
            }
            if let Some(start) = line.find("@workgroup_size(") {
                pending_size = Some(parse_workgroup_size(name, line_no, &line[start..])?);
            }

            if let Some(fn_name) = function_name(line) {
                if pending_compute {
                    let workgroup_size = pending_size.ok_or_else(|| {
                        parse_error(
                            name,
                            line_no,
                            format!("compute entry point '{}' has no @workgroup_size", fn_name),
                        )
                    })?;
                    entry_points.push(EntryPoint {
                        name: fn_name.to_string(),
                        workgroup_size,
                        line: line_no,
                    });
                }
                pending_compute = false;
                pending_size = None;
            }
        }

        log::debug!(
            "[ComputeProgram] Parsed '{}': {} entry points, {} bindings",
            name,
            entry_points.len(),
            bindings.len()
        );

        Ok(Self {
            name: name.to_string(),
            source,
            entry_points,
            bindings,
        })
    }

    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|e| e.name == name)
    }

    pub fn binding(&self, name: &str) -> Option<&BindingInfo> {
        self.bindings.iter().find(|b| b.name == name)
    }
}

fn parse_error(program: &str, line: usize, reason: impl Into<String>) -> TerrainError {
    TerrainError::ShaderParse {
        program: program.to_string(),
        line,
        reason: reason.into(),
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// `fn name(` anywhere in the line
fn function_name(line: &str) -> Option<&str> {
    let start = if line.starts_with("fn ") {
        3
    } else {
        line.find(" fn ")? + 4
    };
    let rest = &line[start..];
    let end = rest.find('(')?;
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn attribute_value<'a>(line: &'a str, attribute: &str) -> Option<&'a str> {
    let start = line.find(attribute)? + attribute.len();
    let end = line[start..].find(')')? + start;
    Some(line[start..end].trim())
}

fn parse_workgroup_size(program: &str, line_no: usize, attr: &str) -> TerrainResult<[u32; 3]> {
    let args = attribute_value(attr, "@workgroup_size(")
        .ok_or_else(|| parse_error(program, line_no, "unterminated @workgroup_size"))?;

    let mut size = [1u32; 3];
    let parts: Vec<&str> = args.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(parse_error(
            program,
            line_no,
            format!("@workgroup_size takes 1 to 3 values, got '{}'", args),
        ));
    }
    for (axis, part) in parts.iter().enumerate() {
        let digits = part.trim_end_matches('u').trim_end_matches('i');
        size[axis] = digits
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                parse_error(
                    program,
                    line_no,
                    format!("workgroup size '{}' is not a positive integer literal", part),
                )
            })?;
    }
    Ok(size)
}

fn parse_binding(program: &str, line_no: usize, line: &str) -> TerrainResult<BindingInfo> {
    let group = attribute_value(line, "@group(")
        .ok_or_else(|| parse_error(program, line_no, "@binding without @group"))?;
    if group != "0" {
        return Err(parse_error(
            program,
            line_no,
            format!("only bind group 0 is supported, found {}", group),
        ));
    }
    let binding = attribute_value(line, "@binding(")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| parse_error(program, line_no, "malformed @binding index"))?;

    let var_start = line
        .find("var")
        .ok_or_else(|| parse_error(program, line_no, "binding is not a var declaration"))?;
    let mut rest = &line[var_start + 3..];

    // Address space qualifier: var<uniform>, var<storage, read_write>
    let mut qualifier: Option<Vec<&str>> = None;
    if rest.starts_with('<') {
        let end = rest
            .find('>')
            .ok_or_else(|| parse_error(program, line_no, "unterminated address space"))?;
        qualifier = Some(rest[1..end].split(',').map(str::trim).collect());
        rest = &rest[end + 1..];
    }

    let colon = rest
        .find(':')
        .ok_or_else(|| parse_error(program, line_no, "binding has no type"))?;
    let name = rest[..colon].trim().to_string();
    let type_name = rest[colon + 1..].trim().trim_end_matches(';').trim().to_string();
    if name.is_empty() || type_name.is_empty() {
        return Err(parse_error(program, line_no, "malformed binding declaration"));
    }

    let kind = match qualifier.as_deref() {
        Some(["uniform"]) => BindingKind::Uniform,
        Some(["storage"]) => BindingKind::StorageBuffer { read_only: true },
        Some(["storage", access]) => match StorageAccess::parse(access) {
            Some(StorageAccess::Read) => BindingKind::StorageBuffer { read_only: true },
            Some(StorageAccess::ReadWrite) => BindingKind::StorageBuffer { read_only: false },
            _ => {
                return Err(parse_error(
                    program,
                    line_no,
                    format!("invalid storage access '{}'", access),
                ))
            }
        },
        Some(other) => {
            return Err(parse_error(
                program,
                line_no,
                format!("unsupported address space '{}'", other.join(", ")),
            ))
        }
        None => parse_texture_kind(program, line_no, &type_name)?,
    };

    Ok(BindingInfo {
        binding,
        name,
        kind,
        type_name,
    })
}

fn parse_texture_kind(program: &str, line_no: usize, type_name: &str) -> TerrainResult<BindingKind> {
    if let Some(args) = type_name
        .strip_prefix("texture_storage_3d<")
        .and_then(|s| s.strip_suffix('>'))
    {
        let mut parts = args.split(',').map(str::trim);
        let format = parts.next().unwrap_or_default().to_string();
        let access = parts
            .next()
            .and_then(StorageAccess::parse)
            .ok_or_else(|| parse_error(program, line_no, "storage texture without access mode"))?;
        return Ok(BindingKind::StorageTexture { format, access });
    }
    if type_name.starts_with("texture_3d<") {
        return Ok(BindingKind::Texture);
    }
    Err(parse_error(
        program,
        line_no,
        format!("unsupported resource type '{}'", type_name),
    ))
}

/// A resolved, compiled kernel
#[derive(Debug, Clone)]
pub struct Kernel {
    pub handle: KernelHandle,
    pub name: String,
    pub program: String,
    pub group_size: [u32; 3],
    pub bindings: Vec<BindingInfo>,
}

impl Kernel {
    pub fn declares(&self, slot: &str) -> bool {
        self.bindings.iter().any(|b| b.name == slot)
    }

    pub fn binding(&self, slot: &str) -> Option<&BindingInfo> {
        self.bindings.iter().find(|b| b.name == slot)
    }
}

/// Resolves kernel names against programs and compiles them on a device
pub struct KernelBinder;

impl KernelBinder {
    pub fn resolve<D: ComputeDevice + ?Sized>(
        device: &mut D,
        program: &ComputeProgram,
        kernel_name: &str,
    ) -> TerrainResult<Kernel> {
        let entry = program
            .entry_point(kernel_name)
            .ok_or_else(|| TerrainError::KernelNotFound {
                program: program.name.clone(),
                kernel: kernel_name.to_string(),
            })?;

        let handle = device.compile_kernel(program, entry)?;

        log::info!(
            "[KernelBinder] Resolved kernel '{}' from '{}' (workgroup {:?}, {} bindings) on {}",
            kernel_name,
            program.name,
            entry.workgroup_size,
            program.bindings.len(),
            device.backend_name()
        );

        Ok(Kernel {
            handle,
            name: kernel_name.to_string(),
            program: program.name.clone(),
            group_size: entry.workgroup_size,
            bindings: program.bindings.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
struct ChunkParams {
    chunkSize: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: ChunkParams;
@group(0) @binding(1) var noiseTexture: texture_3d<f32>;
@group(0) @binding(2) var normalTexture: texture_storage_3d<rgba16float, write>;
@group(0) @binding(3) var<storage, read_write> vertices: array<vec4<f32>>;
@group(0) @binding(4) var<storage, read_write> verticesCounter: atomic<u32>;
@group(0) @binding(5) var<storage> lookup: array<i32>;

fn helper(x: f32) -> f32 {
    return x;
}

// the kernel
@compute @workgroup_size(8, 8, 8)
fn normalEstimate(@builtin(global_invocation_id) id: vec3<u32>) {
}

@compute
@workgroup_size(64)
fn copyMeshBuffers(@builtin(global_invocation_id) id: vec3<u32>) {
}
"#;

    #[test]
    fn test_parse_entry_points() {
        let program = ComputeProgram::parse("sample", SAMPLE).unwrap();
        assert_eq!(program.entry_points.len(), 2);

        let normals = program.entry_point("normalEstimate").unwrap();
        assert_eq!(normals.workgroup_size, [8, 8, 8]);

        let copy = program.entry_point("copyMeshBuffers").unwrap();
        assert_eq!(copy.workgroup_size, [64, 1, 1]);

        assert!(program.entry_point("helper").is_none());
    }

    #[test]
    fn test_parse_bindings() {
        let program = ComputeProgram::parse("sample", SAMPLE).unwrap();
        assert_eq!(program.bindings.len(), 6);

        assert_eq!(program.binding("params").unwrap().kind, BindingKind::Uniform);
        assert_eq!(program.binding("noiseTexture").unwrap().kind, BindingKind::Texture);
        assert_eq!(
            program.binding("normalTexture").unwrap().kind,
            BindingKind::StorageTexture {
                format: "rgba16float".to_string(),
                access: StorageAccess::Write
            }
        );
        assert_eq!(
            program.binding("vertices").unwrap().kind,
            BindingKind::StorageBuffer { read_only: false }
        );
        assert_eq!(
            program.binding("lookup").unwrap().kind,
            BindingKind::StorageBuffer { read_only: true }
        );
        assert_eq!(program.binding("verticesCounter").unwrap().binding, 4);
    }

    #[test]
    fn test_parse_errors_report_line() {
        let bad = "@group(0) @binding(0) var<uniform> params: P;\n@group(1) @binding(0) var<uniform> other: P;\n";
        match ComputeProgram::parse("bad", bad) {
            Err(TerrainError::ShaderParse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }

        let no_size = "@compute\nfn main() {}\n";
        assert!(ComputeProgram::parse("no_size", no_size).is_err());

        let dup = "@group(0) @binding(0) var<uniform> a: P;\n@group(0) @binding(0) var<uniform> b: P;\n";
        assert!(ComputeProgram::parse("dup", dup).is_err());
    }

    #[test]
    fn test_kernel_declares() {
        let program = ComputeProgram::parse("sample", SAMPLE).unwrap();
        let kernel = Kernel {
            handle: KernelHandle(0),
            name: "normalEstimate".to_string(),
            program: program.name.clone(),
            group_size: [8, 8, 8],
            bindings: program.bindings.clone(),
        };
        assert!(kernel.declares("verticesCounter"));
        assert!(!kernel.declares("triangles"));
    }
}
