//! Chunk generation pipeline
//!
//! Owns the compute device, the shared chunk resources and the four stages.
//! `generate_chunk` runs Bind → Density → Normals → IsoSurface [→ CopyMesh] →
//! counter readback for one chunk, in queue order.

use std::time::{Duration, Instant};

use glam::Vec3;

use crate::config::{ChunkConfig, SizingKey};
use crate::error::{TerrainError, TerrainResult};
use crate::generation::stages::{ComputeStage, StageKind};
use crate::gpu::allocator::{check_capacity, triangle_capacity};
use crate::gpu::readback::{CounterCopy, CounterTransfer};
use crate::gpu::shaders::ShaderLibrary;
use crate::gpu::{
    bytes_to_vec4, BufferAllocator, ComputeDevice, ComputeProgram,
    GeometryBufferSet, ParameterBinder, VertexCountReadback, VolumeSet,
};
use crate::constants::layout::VERTEX_STRIDE;

/// Result of generating one chunk
#[derive(Debug, Clone, Copy)]
pub struct ChunkOutput {
    /// Shared geometry buffers; only valid until the next chunk is generated
    pub buffers: GeometryBufferSet,
    /// Vertices written, a multiple of 3 and never above the vertex capacity
    pub vertex_count: u64,
    pub world_position: Vec3,
    pub generation: u64,
    /// The kernel produced more geometry than the buffers hold
    pub overflow: bool,
    pub elapsed: Duration,
}

impl ChunkOutput {
    pub fn triangle_count(&self) -> u64 {
        self.vertex_count / 3
    }
}

/// A chunk whose dispatches are queued and whose counter is still in flight
#[derive(Debug)]
pub struct PendingChunk {
    transfer: CounterTransfer,
    buffers: GeometryBufferSet,
    world_position: Vec3,
    started: Instant,
}

impl PendingChunk {
    pub fn world_position(&self) -> Vec3 {
        self.world_position
    }

    pub fn generation(&self) -> u64 {
        self.buffers.generation
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub chunks_generated: u64,
    pub total_vertices: u64,
    pub overflow_count: u64,
    pub last_elapsed: Duration,
}

pub struct ChunkPipeline<D: ComputeDevice> {
    device: D,
    density: ComputeStage,
    normals: ComputeStage,
    isosurface: ComputeStage,
    copy_mesh: Option<ComputeStage>,
    allocator: BufferAllocator,
    binder: ParameterBinder,
    readback: VertexCountReadback,
    config: Option<ChunkConfig>,
    sizing: Option<SizingKey>,
    stats: PipelineStats,
}

impl<D: ComputeDevice> ChunkPipeline<D> {
    /// Pipeline running the shipped programs
    pub fn builtin(device: D) -> TerrainResult<Self> {
        let library = ShaderLibrary::builtin()?;
        Self::new(device, &library)
    }

    pub fn new(device: D, library: &ShaderLibrary) -> TerrainResult<Self> {
        Self::with_programs(
            device,
            &library.density,
            &library.normals,
            &library.isosurface,
            Some(&library.copy_mesh),
        )
    }

    /// Resolve every kernel up front; a missing required kernel is fatal
    pub fn with_programs(
        mut device: D,
        density: &ComputeProgram,
        normals: &ComputeProgram,
        isosurface: &ComputeProgram,
        copy_mesh: Option<&ComputeProgram>,
    ) -> TerrainResult<Self> {
        let density = ComputeStage::new(&mut device, density, StageKind::DensityField)?;
        let normals = ComputeStage::new(&mut device, normals, StageKind::NormalEstimation)?;
        let isosurface = ComputeStage::new(&mut device, isosurface, StageKind::IsoSurface)?;
        let copy_mesh = match copy_mesh {
            Some(program) => match ComputeStage::new(&mut device, program, StageKind::CopyMesh) {
                Ok(stage) => Some(stage),
                Err(TerrainError::KernelNotFound { .. }) => {
                    log::warn!("[ChunkPipeline] No copyMeshBuffers kernel, copy stage disabled");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        log::info!(
            "[ChunkPipeline] Created on {} backend (copy stage {})",
            device.backend_name(),
            if copy_mesh.is_some() { "available" } else { "unavailable" }
        );

        Ok(Self {
            device,
            density,
            normals,
            isosurface,
            copy_mesh,
            allocator: BufferAllocator::new(),
            binder: ParameterBinder::new(),
            readback: VertexCountReadback::new(),
            config: None,
            sizing: None,
            stats: PipelineStats::default(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> Option<&ChunkConfig> {
        self.config.as_ref()
    }

    /// Current allocation generation
    pub fn generation(&self) -> u64 {
        self.allocator.generation()
    }

    pub fn resources(&self) -> Option<&(GeometryBufferSet, VolumeSet)> {
        self.allocator.current()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn stage(&self, kind: StageKind) -> Option<&ComputeStage> {
        match kind {
            StageKind::DensityField => Some(&self.density),
            StageKind::NormalEstimation => Some(&self.normals),
            StageKind::IsoSurface => Some(&self.isosurface),
            StageKind::CopyMesh => self.copy_mesh.as_ref(),
        }
    }

    /// Validate a config, plan every dispatch and (re)allocate when sizing changed
    pub fn configure(&mut self, config: ChunkConfig) -> TerrainResult<()> {
        config.validate()?;

        let limits = self.device.limits();
        let triangles = triangle_capacity(config.chunk_size, config.resolution_per_voxel);
        let density_groups = self.density.plan(&config, triangles, &limits)?;
        let normal_groups = self.normals.plan(&config, triangles, &limits)?;
        let iso_groups = self.isosurface.plan(&config, triangles, &limits)?;
        let copy_groups = match (&self.copy_mesh, config.copy_mesh_buffers) {
            (Some(stage), true) => Some(stage.plan(&config, triangles, &limits)?),
            (None, true) => {
                return Err(TerrainError::invalid_config(
                    "copy_mesh_buffers",
                    "no copyMeshBuffers kernel available",
                ))
            }
            (_, false) => None,
        };

        let sizing = config.sizing_key();
        if self.sizing != Some(sizing) || !self.allocator.is_allocated() {
            self.sizing = None;
            self.config = None;
            self.allocator.allocate(
                &mut self.device,
                config.chunk_size,
                config.resolution_per_voxel,
                config.max_debug_points,
            )?;
            self.sizing = Some(sizing);
        }

        self.density.set_groups(density_groups);
        self.normals.set_groups(normal_groups);
        self.isosurface.set_groups(iso_groups);
        if let (Some(stage), Some(groups)) = (self.copy_mesh.as_mut(), copy_groups) {
            stage.set_groups(groups);
        }

        log::info!(
            "[ChunkPipeline] Configured chunk size {} (padded {}), resolution {}, groups {:?}/{:?}/{:?}",
            config.chunk_size,
            config.padded_size(),
            config.resolution_per_voxel,
            density_groups,
            normal_groups,
            iso_groups
        );
        self.config = Some(config);
        Ok(())
    }

    /// Generate one chunk and block until its vertex count is known
    pub fn generate_chunk(&mut self, world_position: Vec3, chunk_size: u32) -> TerrainResult<ChunkOutput> {
        let (buffers, counter, started) = self.record_chunk(world_position, chunk_size)?;
        let raw = self.readback.fetch(&mut self.device, counter)?;
        Ok(self.finish_chunk(buffers, world_position, raw, started))
    }

    /// Queue one chunk and start an async fetch of its vertex count
    pub fn begin_chunk(&mut self, world_position: Vec3, chunk_size: u32) -> TerrainResult<PendingChunk> {
        let (buffers, counter, started) = self.record_chunk(world_position, chunk_size)?;
        let transfer = self.readback.fetch_async(&mut self.device, counter)?;
        Ok(PendingChunk {
            transfer,
            buffers,
            world_position,
            started,
        })
    }

    /// Poll a pending chunk once; `Some` when its vertex count arrived
    pub fn poll_chunk(&mut self, pending: &mut PendingChunk) -> TerrainResult<Option<ChunkOutput>> {
        let live = self.allocator.generation();
        if pending.buffers.generation != live {
            pending.transfer.cancel(&mut self.device);
            return Err(TerrainError::StaleGeneration {
                request: pending.buffers.generation,
                live,
            });
        }
        if !pending.transfer.update(&mut self.device)? {
            return Ok(None);
        }
        let raw = pending.transfer.data().unwrap_or_default();
        Ok(Some(self.finish_chunk(
            pending.buffers,
            pending.world_position,
            raw,
            pending.started,
        )))
    }

    /// Drop a pending chunk without waiting for its count
    pub fn cancel_chunk(&mut self, mut pending: PendingChunk) {
        pending.transfer.cancel(&mut self.device);
    }

    fn record_chunk(
        &mut self,
        world_position: Vec3,
        chunk_size: u32,
    ) -> TerrainResult<(GeometryBufferSet, CounterCopy, Instant)> {
        let config = self.config.as_ref().ok_or(TerrainError::NotConfigured)?;
        if chunk_size != config.chunk_size {
            return Err(TerrainError::ConfigMismatch {
                configured: config.chunk_size,
                requested: chunk_size,
            });
        }
        let (buffers, volumes) = *self.allocator.current().ok_or(TerrainError::NotConfigured)?;
        let started = Instant::now();

        let mut kernels = vec![
            self.density.kernel(),
            self.normals.kernel(),
            self.isosurface.kernel(),
        ];
        let copy_stage = self
            .copy_mesh
            .as_ref()
            .filter(|_| config.copy_mesh_buffers);
        if let Some(stage) = copy_stage {
            kernels.push(stage.kernel());
        }
        self.binder.bind(
            &mut self.device,
            &kernels,
            &buffers,
            &volumes,
            world_position,
            chunk_size,
            &config.noise,
            config.resolution_per_voxel,
        )?;

        self.device.reset_counter(buffers.vertices)?;
        self.device.reset_counter(buffers.debug_points)?;

        self.density.dispatch(&mut self.device)?;
        self.normals.dispatch(&mut self.device)?;
        self.isosurface.dispatch(&mut self.device)?;
        if let Some(stage) = copy_stage {
            stage.dispatch(&mut self.device)?;
        }

        let counter = self
            .readback
            .copy_counter(&mut self.device, buffers.vertices, buffers.counter_readback)?;
        Ok((buffers, counter, started))
    }

    fn finish_chunk(
        &mut self,
        buffers: GeometryBufferSet,
        world_position: Vec3,
        raw_count: u64,
        started: Instant,
    ) -> ChunkOutput {
        let mut vertex_count = raw_count - raw_count % 3;
        let mut overflow = false;
        if let Err(e) = check_capacity(vertex_count, buffers.vertex_capacity) {
            log::warn!(
                "[ChunkPipeline] {} at {:?}; clamping to capacity",
                e,
                world_position
            );
            vertex_count = buffers.vertex_capacity - buffers.vertex_capacity % 3;
            overflow = true;
            self.stats.overflow_count += 1;
        }

        let elapsed = started.elapsed();
        self.stats.chunks_generated += 1;
        self.stats.total_vertices += vertex_count;
        self.stats.last_elapsed = elapsed;

        log::debug!(
            "[ChunkPipeline] Chunk at {:?}: {} vertices in {:?}",
            world_position,
            vertex_count,
            elapsed
        );

        ChunkOutput {
            buffers,
            vertex_count,
            world_position,
            generation: buffers.generation,
            overflow,
            elapsed,
        }
    }

    /// Blocking read of a chunk's vertices and normals from the shared buffers
    pub fn read_geometry(&mut self, output: &ChunkOutput) -> TerrainResult<(Vec<[f32; 4]>, Vec<[f32; 4]>)> {
        let live = self.allocator.generation();
        if output.generation != live {
            return Err(TerrainError::StaleGeneration {
                request: output.generation,
                live,
            });
        }
        let bytes = output.vertex_count * VERTEX_STRIDE;
        if bytes == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let vertices = self.device.read_buffer(output.buffers.vertices, 0, bytes)?;
        let normals = self.device.read_buffer(output.buffers.normals, 0, bytes)?;
        Ok((bytes_to_vec4(&vertices), bytes_to_vec4(&normals)))
    }

    /// Release every shared resource; generation requires `configure` again
    pub fn release(&mut self) {
        self.allocator.release(&mut self.device);
        self.config = None;
        self.sizing = None;
        log::info!("[ChunkPipeline] Released chunk resources");
    }
}
