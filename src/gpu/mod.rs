//! Compute backend abstraction
//!
//! Every GPU resource is addressed by a small copyable id handed out by a
//! [`ComputeDevice`]. The pipeline, the renderers and the streaming controller only
//! ever hold ids, so the same code drives the wgpu backend and the software backend.

pub mod allocator;
pub mod cpu_device;
pub mod kernel;
pub mod params;
pub mod readback;
pub mod shaders;
pub mod software_kernels;
pub mod tables;
pub mod wgpu_device;

pub use allocator::BufferAllocator;
pub use cpu_device::CpuDevice;
pub use kernel::{BindingInfo, BindingKind, ComputeProgram, EntryPoint, Kernel, KernelBinder};
pub use params::{ChunkUniforms, ParamValue, ParameterBinder};
pub use readback::{AsyncTransfer, CounterCopy, CounterTransfer, VertexCountReadback};
pub use wgpu_device::WgpuDevice;

use crate::error::TerrainResult;

macro_rules! resource_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub const KIND: &'static str = $kind;

            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

resource_id!(BufferId, "buffer");
resource_id!(VolumeId, "volume");
resource_id!(KernelHandle, "kernel");
resource_id!(TransferId, "transfer");

/// What an append buffer's counter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUnit {
    Triangles,
    Vertices,
}

impl CounterUnit {
    pub fn vertices_per_count(self) -> u64 {
        match self {
            CounterUnit::Triangles => 3,
            CounterUnit::Vertices => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Plain read/write storage buffer
    Storage,
    /// Storage buffer with a companion atomic counter
    Append { unit: CounterUnit },
    /// Copy target that the host reads back
    Readback,
    /// Chunk-owned geometry drawn directly by the render pipeline
    Vertex,
    /// Indirect draw arguments
    IndirectArgs,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor<'a> {
    pub label: &'a str,
    pub size: u64,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// Single channel density (r32float)
    Scalar,
    /// Four channel vector (rgba16float)
    Vector,
}

#[derive(Debug, Clone)]
pub struct VolumeDescriptor<'a> {
    pub label: &'a str,
    /// Texels per axis; volumes are always cubes
    pub extent: u32,
    pub format: VolumeFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_workgroups_per_dimension: u32,
    pub max_texture_dimension_3d: u32,
}

/// The geometry buffers shared by every chunk of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBufferSet {
    pub vertices: BufferId,
    pub normals: BufferId,
    pub triangles: BufferId,
    pub counter_readback: BufferId,
    pub debug_points: BufferId,
    pub vertex_capacity: u64,
    pub triangle_capacity: u64,
    pub debug_capacity: u64,
    /// Allocation generation these ids belong to
    pub generation: u64,
}

/// Density and normal volumes, (chunk_size + 1)^3 texels each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSet {
    pub density: VolumeId,
    pub normals: VolumeId,
    pub extent: u32,
}

/// A compute backend with a single ordered command queue
///
/// Commands execute in submission order. Blocking reads observe every command
/// submitted before them; async transfers capture the buffer contents at the point
/// they were issued.
pub trait ComputeDevice {
    fn backend_name(&self) -> &'static str;

    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> TerrainResult<BufferId>;

    fn create_volume(&mut self, desc: &VolumeDescriptor) -> TerrainResult<VolumeId>;

    /// Destroying an unknown id is a no-op
    fn destroy_buffer(&mut self, id: BufferId);

    fn destroy_volume(&mut self, id: VolumeId);

    fn buffer_size(&self, id: BufferId) -> TerrainResult<u64>;

    /// Kind the buffer was created with
    fn buffer_kind(&self, id: BufferId) -> TerrainResult<BufferKind>;

    /// Build a kernel for one entry point of a parsed program
    fn compile_kernel(
        &mut self,
        program: &ComputeProgram,
        entry: &EntryPoint,
    ) -> TerrainResult<KernelHandle>;

    /// Write the shared uniform block of a kernel
    fn set_uniforms(&mut self, kernel: KernelHandle, uniforms: &ChunkUniforms) -> TerrainResult<()>;

    /// Bind a buffer to a named slot. An append buffer also binds its counter at
    /// `<slot>Counter` when the kernel declares that slot.
    fn bind_buffer(&mut self, kernel: KernelHandle, slot: &str, buffer: BufferId)
        -> TerrainResult<()>;

    fn bind_volume(&mut self, kernel: KernelHandle, slot: &str, volume: VolumeId)
        -> TerrainResult<()>;

    /// Zero the counter of an append buffer
    fn reset_counter(&mut self, buffer: BufferId) -> TerrainResult<()>;

    fn dispatch(&mut self, kernel: KernelHandle, groups: [u32; 3]) -> TerrainResult<()>;

    /// Copy the 4-byte counter of an append buffer into the start of `dest`
    fn copy_counter(&mut self, source: BufferId, dest: BufferId) -> TerrainResult<()>;

    fn copy_buffer(
        &mut self,
        source: BufferId,
        source_offset: u64,
        dest: BufferId,
        dest_offset: u64,
        size: u64,
    ) -> TerrainResult<()>;

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> TerrainResult<()>;

    /// Blocking read; waits for all submitted work
    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> TerrainResult<Vec<u8>>;

    /// Start an asynchronous copy of a buffer range to host memory
    fn begin_transfer(&mut self, buffer: BufferId, offset: u64, size: u64)
        -> TerrainResult<TransferId>;

    /// Advance a transfer without blocking; true once its data is available
    fn poll_transfer(&mut self, id: TransferId) -> TerrainResult<bool>;

    /// Take the data of a finished transfer, releasing it
    fn take_transfer(&mut self, id: TransferId) -> TerrainResult<Vec<u8>>;

    /// Drop a transfer whether or not it finished
    fn cancel_transfer(&mut self, id: TransferId);
}

/// Reinterpret a little-endian byte blob as vec4<f32> elements
pub fn bytes_to_vec4(bytes: &[u8]) -> Vec<[f32; 4]> {
    bytes
        .chunks_exact(16)
        .map(|chunk| {
            let mut v = [0.0f32; 4];
            for (i, word) in chunk.chunks_exact(4).enumerate() {
                v[i] = f32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            }
            v
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_unit_multiplier() {
        assert_eq!(CounterUnit::Triangles.vertices_per_count(), 3);
        assert_eq!(CounterUnit::Vertices.vertices_per_count(), 1);
    }

    #[test]
    fn test_bytes_to_vec4() {
        let data: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 0.0, -1.0, 0.5, 0.25, 1.0]).to_vec();
        let out = bytes_to_vec4(&data);
        assert_eq!(out, vec![[1.0, 2.0, 3.0, 0.0], [-1.0, 0.5, 0.25, 1.0]]);
    }
}
