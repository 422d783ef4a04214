//! Host readback chunk renderer
//!
//! Vertices and normals are copied to host memory with async transfers. A chunk
//! becomes renderable once both transfers finished and its request still belongs to
//! the live allocation and the current pass.

use glam::Vec3;

use crate::config::RendererKind;
use crate::constants::layout::VERTEX_STRIDE;
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{bytes_to_vec4, AsyncTransfer, ComputeDevice, GeometryBufferSet};
use crate::renderer::{ActiveChunkSet, ChunkBounds, ChunkMeshInstance, ChunkRenderer, HostMesh};
use crate::world::ChunkCoord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Ready,
    Consumed,
}

/// Outstanding readback of one chunk's geometry
#[derive(Debug)]
pub struct ReadbackRequest {
    vertices: AsyncTransfer,
    normals: AsyncTransfer,
    pub coord: ChunkCoord,
    pub world_position: Vec3,
    pub expected_vertex_count: u64,
    pub generation: u64,
    pub pass_epoch: u64,
    state: RequestState,
}

impl ReadbackRequest {
    pub fn begin<D: ComputeDevice + ?Sized>(
        device: &mut D,
        coord: ChunkCoord,
        geometry: &GeometryBufferSet,
        world_position: Vec3,
        vertex_count: u64,
        pass_epoch: u64,
    ) -> TerrainResult<Self> {
        let bytes = vertex_count * VERTEX_STRIDE;
        let vertices = AsyncTransfer::begin(device, geometry.vertices, 0, bytes)?;
        let normals = match AsyncTransfer::begin(device, geometry.normals, 0, bytes) {
            Ok(transfer) => transfer,
            Err(e) => {
                let mut vertices = vertices;
                vertices.cancel(device);
                return Err(e);
            }
        };
        Ok(Self {
            vertices,
            normals,
            coord,
            world_position,
            expected_vertex_count: vertex_count,
            generation: geometry.generation,
            pass_epoch,
            state: RequestState::Pending,
        })
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// True only when both the vertex and the normal transfer are done
    pub fn is_done(&self) -> bool {
        self.vertices.is_done() && self.normals.is_done()
    }

    pub fn update<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) -> TerrainResult<bool> {
        if self.state != RequestState::Pending {
            return Ok(self.state == RequestState::Ready);
        }
        self.vertices.update(device)?;
        self.normals.update(device)?;
        if self.is_done() {
            self.state = RequestState::Ready;
        }
        Ok(self.state == RequestState::Ready)
    }

    /// Assemble the host mesh; `None` unless ready
    pub fn take_mesh(&mut self) -> Option<HostMesh> {
        if self.state != RequestState::Ready {
            return None;
        }
        let vertices = self.vertices.take_data()?;
        let normals = self.normals.take_data()?;
        self.state = RequestState::Consumed;
        Some(HostMesh::from_soup(
            &bytes_to_vec4(&vertices),
            &bytes_to_vec4(&normals),
        ))
    }

    pub fn cancel<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        self.vertices.cancel(device);
        self.normals.cancel(device);
        self.state = RequestState::Consumed;
    }
}

pub struct ReadbackChunkRenderer {
    chunks: ActiveChunkSet<ChunkMeshInstance>,
    pending: Vec<ReadbackRequest>,
    chunk_size: u32,
    discarded: u64,
}

impl ReadbackChunkRenderer {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunks: ActiveChunkSet::new(),
            pending: Vec::new(),
            chunk_size,
            discarded: 0,
        }
    }

    pub fn chunk(&self, coord: &ChunkCoord) -> Option<&ChunkMeshInstance> {
        self.chunks.get(coord)
    }

    pub fn meshes(&self) -> impl Iterator<Item = &ChunkMeshInstance> {
        self.chunks.visible().map(|(_, instance)| instance)
    }

    pub fn pending(&self) -> &[ReadbackRequest] {
        &self.pending
    }

    /// Requests dropped as stale since construction
    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }

    fn instance(&self, coord: ChunkCoord, world_position: Vec3, mesh: HostMesh, generation: u64) -> ChunkMeshInstance {
        ChunkMeshInstance {
            coord,
            world_position,
            bounds: ChunkBounds::from_chunk(world_position, self.chunk_size),
            mesh,
            generation,
        }
    }

    fn cancel_pending<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        for mut request in self.pending.drain(..) {
            request.cancel(device);
        }
    }
}

impl<D: ComputeDevice + ?Sized> ChunkRenderer<D> for ReadbackChunkRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Readback
    }

    fn set_chunk_size(&mut self, chunk_size: u32) {
        self.chunk_size = chunk_size;
    }

    fn begin_pass(&mut self, device: &mut D) {
        self.cancel_pending(device);
        self.chunks.begin();
    }

    fn add_chunk(
        &mut self,
        device: &mut D,
        coord: ChunkCoord,
        geometry: &GeometryBufferSet,
        world_position: Vec3,
        vertex_count: u64,
    ) -> TerrainResult<()> {
        if vertex_count == 0 {
            let instance = self.instance(coord, world_position, HostMesh::new(), geometry.generation);
            self.chunks.insert(coord, instance);
            return Ok(());
        }
        let request = ReadbackRequest::begin(
            device,
            coord,
            geometry,
            world_position,
            vertex_count,
            self.chunks.epoch(),
        )?;
        self.pending.push(request);
        Ok(())
    }

    fn update(&mut self, device: &mut D, live_generation: u64) -> TerrainResult<usize> {
        let epoch = self.chunks.epoch();
        let mut completed = 0;
        let mut index = 0;

        while index < self.pending.len() {
            let request = &mut self.pending[index];

            if request.pass_epoch != epoch {
                log::warn!(
                    "[ReadbackChunkRenderer] Discarding readback of chunk {} from pass {}",
                    request.coord,
                    request.pass_epoch
                );
                request.cancel(device);
                self.pending.swap_remove(index);
                self.discarded += 1;
                continue;
            }
            if request.generation != live_generation {
                let err = TerrainError::StaleGeneration {
                    request: request.generation,
                    live: live_generation,
                };
                log::error!("[ReadbackChunkRenderer] Chunk {}: {}", request.coord, err);
                request.cancel(device);
                self.pending.swap_remove(index);
                self.discarded += 1;
                continue;
            }

            if !request.update(device)? {
                index += 1;
                continue;
            }

            let mut request = self.pending.swap_remove(index);
            if let Some(mesh) = request.take_mesh() {
                let instance =
                    self.instance(request.coord, request.world_position, mesh, request.generation);
                self.chunks.insert(request.coord, instance);
                completed += 1;
            }
        }

        Ok(completed)
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn commit_pass(&mut self, _device: &mut D) {
        let replaced = self.chunks.commit();
        log::info!(
            "[ReadbackChunkRenderer] Committed {} chunks, dropped {}",
            self.chunks.len(),
            replaced.len()
        );
    }

    fn abort_pass(&mut self, device: &mut D) {
        self.cancel_pending(device);
        self.chunks.abort();
    }

    fn clear_chunks(&mut self, device: &mut D) {
        self.cancel_pending(device);
        self.chunks.clear();
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn pass_epoch(&self) -> u64 {
        self.chunks.epoch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferAllocator, CpuDevice};

    fn setup() -> (CpuDevice, GeometryBufferSet) {
        let mut device = CpuDevice::new();
        let mut allocator = BufferAllocator::new();
        let (geometry, _) = allocator.allocate(&mut device, 7, 1, 1).unwrap();
        let soup: Vec<f32> = (0..12).map(|i| i as f32).collect();
        device
            .write_buffer(geometry.vertices, 0, bytemuck::cast_slice(&soup))
            .unwrap();
        (device, geometry)
    }

    #[test]
    fn test_request_done_only_when_both_transfers_done() {
        let (mut device, geometry) = setup();
        device.set_transfer_latency(2);
        let mut request =
            ReadbackRequest::begin(&mut device, ChunkCoord::new(0, 0, 0), &geometry, Vec3::ZERO, 3, 0)
                .unwrap();

        assert!(!request.is_done());
        assert!(!request.update(&mut device).unwrap());
        assert_eq!(request.state(), RequestState::Pending);
        assert!(request.take_mesh().is_none());

        assert!(request.update(&mut device).unwrap());
        assert!(request.is_done());
        let mesh = request.take_mesh().unwrap();
        assert_eq!(mesh.positions[1], [4.0, 5.0, 6.0]);
        assert_eq!(request.state(), RequestState::Consumed);
    }

    /// Request whose vertex and normal transfers finish after different poll counts
    fn staggered_request(
        device: &mut CpuDevice,
        geometry: &GeometryBufferSet,
        vertex_polls: u32,
        normal_polls: u32,
    ) -> ReadbackRequest {
        let bytes = 3 * VERTEX_STRIDE;
        device.set_transfer_latency(vertex_polls);
        let vertices = AsyncTransfer::begin(device, geometry.vertices, 0, bytes).unwrap();
        device.set_transfer_latency(normal_polls);
        let normals = AsyncTransfer::begin(device, geometry.normals, 0, bytes).unwrap();
        ReadbackRequest {
            vertices,
            normals,
            coord: ChunkCoord::new(0, 0, 0),
            world_position: Vec3::ZERO,
            expected_vertex_count: 3,
            generation: geometry.generation,
            pass_epoch: 0,
            state: RequestState::Pending,
        }
    }

    #[test]
    fn test_one_finished_transfer_is_not_done() {
        for (vertex_polls, normal_polls) in [(1, 3), (3, 1)] {
            let (mut device, geometry) = setup();
            let mut request = staggered_request(&mut device, &geometry, vertex_polls, normal_polls);

            assert!(!request.update(&mut device).unwrap());
            assert_ne!(request.vertices.is_done(), request.normals.is_done());
            assert!(!request.is_done());
            assert_eq!(request.state(), RequestState::Pending);
            assert!(request.take_mesh().is_none());
            assert_eq!(device.pending_transfer_count(), 1);

            assert!(!request.update(&mut device).unwrap());
            assert!(request.take_mesh().is_none());

            assert!(request.update(&mut device).unwrap());
            assert!(request.is_done());
            let mesh = request.take_mesh().unwrap();
            assert_eq!(mesh.vertex_count(), 3);
            assert_eq!(device.pending_transfer_count(), 0);
        }
    }

    #[test]
    fn test_cancel_with_one_finished_transfer() {
        let (mut device, geometry) = setup();
        let mut request = staggered_request(&mut device, &geometry, 1, 4);
        request.update(&mut device).unwrap();
        assert!(request.vertices.is_done() && !request.normals.is_done());

        request.cancel(&mut device);
        assert_eq!(request.state(), RequestState::Consumed);
        assert!(request.take_mesh().is_none());
        assert_eq!(device.pending_transfer_count(), 0);
    }

    #[test]
    fn test_stale_generation_discarded() {
        let (mut device, geometry) = setup();
        let mut renderer = ReadbackChunkRenderer::new(7);
        let coord = ChunkCoord::new(1, 0, 0);
        ChunkRenderer::<CpuDevice>::add_chunk(&mut renderer, &mut device, coord, &geometry, Vec3::ZERO, 3)
            .unwrap();

        let completed =
            ChunkRenderer::<CpuDevice>::update(&mut renderer, &mut device, geometry.generation + 1).unwrap();
        assert_eq!(completed, 0);
        assert_eq!(renderer.discarded_count(), 1);
        assert!(renderer.chunk(&coord).is_none());
        assert_eq!(device.pending_transfer_count(), 0);
    }

    #[test]
    fn test_results_of_aborted_pass_never_land() {
        let (mut device, geometry) = setup();
        let mut renderer = ReadbackChunkRenderer::new(7);
        let coord = ChunkCoord::new(0, 0, 0);

        ChunkRenderer::<CpuDevice>::begin_pass(&mut renderer, &mut device);
        ChunkRenderer::<CpuDevice>::add_chunk(&mut renderer, &mut device, coord, &geometry, Vec3::ZERO, 3)
            .unwrap();
        ChunkRenderer::<CpuDevice>::abort_pass(&mut renderer, &mut device);

        assert_eq!(ChunkRenderer::<CpuDevice>::pending_count(&renderer), 0);
        assert_eq!(device.pending_transfer_count(), 0);
        assert_eq!(ChunkRenderer::<CpuDevice>::chunk_count(&renderer), 0);
    }
}
