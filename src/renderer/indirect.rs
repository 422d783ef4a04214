//! GPU-resident chunk renderer
//!
//! Each chunk's triangle soup is copied on the GPU into buffers the chunk owns, and a
//! draw-indirect record carries its vertex count. Nothing is read back.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::config::RendererKind;
use crate::constants::layout::{INDIRECT_ARGS_SIZE, VERTEX_STRIDE};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{BufferDescriptor, BufferId, BufferKind, ComputeDevice, GeometryBufferSet};
use crate::renderer::{ActiveChunkSet, ChunkBounds, ChunkRenderer};
use crate::world::ChunkCoord;

/// Matches wgpu's DrawIndirect command layout
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl IndirectDrawArgs {
    /// `{0, 1, 0, 0}`: one instance, vertex count filled per chunk
    pub const TEMPLATE: Self = Self {
        vertex_count: 0,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    };

    pub fn with_vertex_count(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            ..Self::TEMPLATE
        }
    }
}

/// Everything needed to record one chunk's indirect draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndirectDraw {
    pub coord: ChunkCoord,
    pub vertices: BufferId,
    pub normals: BufferId,
    pub args: BufferId,
    pub vertex_count: u64,
    pub world_position: Vec3,
    pub bounds: ChunkBounds,
    pub generation: u64,
}

impl IndirectDraw {
    fn destroy<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        device.destroy_buffer(self.vertices);
        device.destroy_buffer(self.normals);
        device.destroy_buffer(self.args);
    }
}

pub struct IndirectChunkRenderer {
    chunks: ActiveChunkSet<IndirectDraw>,
    chunk_size: u32,
}

impl IndirectChunkRenderer {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunks: ActiveChunkSet::new(),
            chunk_size,
        }
    }

    /// Draw list of the visible set
    pub fn draws(&self) -> Vec<IndirectDraw> {
        self.chunks.visible().map(|(_, draw)| *draw).collect()
    }

    pub fn chunk(&self, coord: &ChunkCoord) -> Option<&IndirectDraw> {
        self.chunks.get(coord)
    }

    fn snapshot<D: ComputeDevice + ?Sized>(
        device: &mut D,
        geometry: &GeometryBufferSet,
        vertex_count: u64,
    ) -> TerrainResult<(BufferId, BufferId, BufferId)> {
        let bytes = vertex_count * VERTEX_STRIDE;
        let vertices = device.create_buffer(&BufferDescriptor {
            label: "chunk vertices",
            size: bytes.max(VERTEX_STRIDE),
            kind: BufferKind::Vertex,
        })?;
        let normals = match device.create_buffer(&BufferDescriptor {
            label: "chunk normals",
            size: bytes.max(VERTEX_STRIDE),
            kind: BufferKind::Vertex,
        }) {
            Ok(id) => id,
            Err(e) => {
                device.destroy_buffer(vertices);
                return Err(e);
            }
        };
        let args = match device.create_buffer(&BufferDescriptor {
            label: "chunk draw args",
            size: INDIRECT_ARGS_SIZE,
            kind: BufferKind::IndirectArgs,
        }) {
            Ok(id) => id,
            Err(e) => {
                device.destroy_buffer(vertices);
                device.destroy_buffer(normals);
                return Err(e);
            }
        };

        let copied = (|| -> TerrainResult<()> {
            device.copy_buffer(geometry.vertices, 0, vertices, 0, bytes)?;
            device.copy_buffer(geometry.normals, 0, normals, 0, bytes)?;
            let count = u32::try_from(vertex_count).map_err(|_| TerrainError::CapacityExceeded {
                reported: vertex_count,
                capacity: u32::MAX as u64,
            })?;
            let record = IndirectDrawArgs::with_vertex_count(count);
            device.write_buffer(args, 0, bytemuck::bytes_of(&record))
        })();
        if let Err(e) = copied {
            device.destroy_buffer(vertices);
            device.destroy_buffer(normals);
            device.destroy_buffer(args);
            return Err(e);
        }
        Ok((vertices, normals, args))
    }
}

impl<D: ComputeDevice + ?Sized> ChunkRenderer<D> for IndirectChunkRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Indirect
    }

    fn set_chunk_size(&mut self, chunk_size: u32) {
        self.chunk_size = chunk_size;
    }

    fn begin_pass(&mut self, device: &mut D) {
        for draw in self.chunks.begin() {
            draw.destroy(device);
        }
    }

    fn add_chunk(
        &mut self,
        device: &mut D,
        coord: ChunkCoord,
        geometry: &GeometryBufferSet,
        world_position: Vec3,
        vertex_count: u64,
    ) -> TerrainResult<()> {
        let (vertices, normals, args) = Self::snapshot(device, geometry, vertex_count)?;
        let draw = IndirectDraw {
            coord,
            vertices,
            normals,
            args,
            vertex_count,
            world_position,
            bounds: ChunkBounds::from_chunk(world_position, self.chunk_size),
            generation: geometry.generation,
        };
        if let Some(replaced) = self.chunks.insert(coord, draw) {
            replaced.destroy(device);
        }
        log::debug!(
            "[IndirectChunkRenderer] Chunk {} snapshotted ({} vertices)",
            coord,
            vertex_count
        );
        Ok(())
    }

    fn update(&mut self, _device: &mut D, _live_generation: u64) -> TerrainResult<usize> {
        Ok(0)
    }

    fn pending_count(&self) -> usize {
        0
    }

    fn commit_pass(&mut self, device: &mut D) {
        for draw in self.chunks.commit() {
            draw.destroy(device);
        }
        log::info!(
            "[IndirectChunkRenderer] Committed {} chunks",
            self.chunks.len()
        );
    }

    fn abort_pass(&mut self, device: &mut D) {
        for draw in self.chunks.abort() {
            draw.destroy(device);
        }
    }

    fn clear_chunks(&mut self, device: &mut D) {
        for draw in self.chunks.clear() {
            draw.destroy(device);
        }
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn pass_epoch(&self) -> u64 {
        self.chunks.epoch()
    }
}
