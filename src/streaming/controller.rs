//! Chunk streaming controller
//!
//! Walks the load grid around a center chunk one chunk per step, hands every chunk to
//! the renderer before the shared buffers are reused, then drains outstanding
//! readbacks and swaps the renderer's visible set in one commit.

use std::time::{Duration, Instant};

use glam::Vec3;

use crate::config::{ChunkConfig, CountMode, RendererKind};
use crate::error::{TerrainError, TerrainResult};
use crate::generation::{ChunkOutput, ChunkPipeline, PendingChunk};
use crate::gpu::ComputeDevice;
use crate::renderer::{create_renderer, ChunkRenderer};
use crate::world::{grid_offsets, ChunkCoord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Idle,
    /// Generating chunks of the current pass
    Running,
    /// Every chunk generated, waiting on renderer readbacks
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Continue,
    Done,
}

/// What one streaming pass produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub center: Option<ChunkCoord>,
    pub chunks_generated: usize,
    pub total_vertices: u64,
    pub overflow_chunks: usize,
    /// Vertex count per chunk, in visiting order
    pub chunk_vertex_counts: Vec<(ChunkCoord, u64)>,
    pub steps: u64,
    pub elapsed: Duration,
}

pub struct ChunkStreamingController<D: ComputeDevice, R = Box<dyn ChunkRenderer<D>>> {
    pipeline: ChunkPipeline<D>,
    renderer: R,
    config: ChunkConfig,
    state: StreamingState,
    center: ChunkCoord,
    coords: Vec<ChunkCoord>,
    cursor: usize,
    in_flight: Option<(ChunkCoord, PendingChunk)>,
    summary: PassSummary,
    pass_started: Option<Instant>,
}

impl<D: ComputeDevice + 'static> ChunkStreamingController<D> {
    /// Controller over the shipped programs with the renderer the config names
    pub fn builtin(device: D, config: ChunkConfig) -> TerrainResult<Self> {
        let pipeline = ChunkPipeline::builtin(device)?;
        let renderer = create_renderer(config.renderer, config.chunk_size);
        Self::new(pipeline, renderer, config)
    }
}

impl<D: ComputeDevice, R: ChunkRenderer<D>> ChunkStreamingController<D, R> {
    pub fn new(mut pipeline: ChunkPipeline<D>, mut renderer: R, config: ChunkConfig) -> TerrainResult<Self> {
        pipeline.configure(config.clone())?;
        renderer.set_chunk_size(config.chunk_size);

        log::info!(
            "[ChunkStreamingController] Created with {:?} renderer, {:?} counts, {} chunks per pass",
            renderer.kind(),
            config.count_mode,
            config.chunks_per_pass()
        );

        Ok(Self {
            pipeline,
            renderer,
            config,
            state: StreamingState::Idle,
            center: ChunkCoord::new(0, 0, 0),
            coords: Vec::new(),
            cursor: 0,
            in_flight: None,
            summary: PassSummary::default(),
            pass_started: None,
        })
    }

    pub fn state(&self) -> StreamingState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != StreamingState::Idle
    }

    pub fn center(&self) -> ChunkCoord {
        self.center
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Chunks handed to the renderer in the current pass, and the pass length
    pub fn progress(&self) -> (usize, usize) {
        (self.cursor, self.coords.len())
    }

    /// Summary of the current, or last finished, pass
    pub fn summary(&self) -> &PassSummary {
        &self.summary
    }

    pub fn pipeline(&self) -> &ChunkPipeline<D> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut ChunkPipeline<D> {
        &mut self.pipeline
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_kind(&self) -> RendererKind {
        self.renderer.kind()
    }

    /// Chunks currently visible in the renderer
    pub fn chunk_count(&self) -> usize {
        self.renderer.chunk_count()
    }

    /// Renderer together with the device its resources live on
    pub fn renderer_and_device(&mut self) -> (&mut R, &mut D) {
        (&mut self.renderer, self.pipeline.device_mut())
    }

    /// Apply a new config; a running pass is aborted first
    pub fn configure(&mut self, config: ChunkConfig) -> TerrainResult<()> {
        if self.is_running() {
            log::info!("[ChunkStreamingController] Reconfigure aborts the running pass");
            self.stop();
        }
        self.pipeline.configure(config.clone())?;
        self.renderer.set_chunk_size(config.chunk_size);
        self.config = config;
        Ok(())
    }

    /// Open a pass around `center`, restarting from the first offset if one is running
    pub fn start(&mut self, center: ChunkCoord) -> TerrainResult<()> {
        if self.pipeline.config().is_none() {
            return Err(TerrainError::NotConfigured);
        }
        let coords = pass_coords(center, self.config.load_radius)?;
        if self.is_running() {
            log::info!(
                "[ChunkStreamingController] Restarting pass at {} (was at {}, {}/{})",
                center,
                self.center,
                self.cursor,
                self.coords.len()
            );
            self.cancel_in_flight();
            self.renderer.abort_pass(self.pipeline.device_mut());
        }

        self.center = center;
        self.coords = coords;
        self.cursor = 0;
        self.summary = PassSummary {
            center: Some(center),
            ..PassSummary::default()
        };
        self.pass_started = Some(Instant::now());
        self.renderer.begin_pass(self.pipeline.device_mut());
        self.state = StreamingState::Running;

        log::info!(
            "[ChunkStreamingController] Streaming {} chunks around {}",
            self.coords.len(),
            center
        );
        Ok(())
    }

    /// Advance the pass by one chunk, or one drain poll
    pub fn step(&mut self) -> TerrainResult<StepStatus> {
        if self.state == StreamingState::Idle {
            return Ok(StepStatus::Done);
        }
        self.summary.steps += 1;
        match self.advance() {
            Ok(status) => Ok(status),
            Err(e) => {
                log::error!(
                    "[ChunkStreamingController] Pass around {} aborted after {} chunks: {}",
                    self.center,
                    self.cursor,
                    e
                );
                self.stop();
                Err(e)
            }
        }
    }

    /// Run a whole pass around `center`, blocking until it is committed
    pub fn run_to_completion(&mut self, center: ChunkCoord) -> TerrainResult<PassSummary> {
        self.start(center)?;
        while self.step()? == StepStatus::Continue {}
        Ok(self.summary.clone())
    }

    /// Open a pass and hand back an iterator yielding one step per item
    pub fn start_streaming_pass(&mut self, center: ChunkCoord) -> TerrainResult<StreamingPass<'_, D, R>> {
        self.start(center)?;
        Ok(StreamingPass {
            controller: self,
            finished: false,
        })
    }

    /// Abort the running pass; the previous visible chunk set stays
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.cancel_in_flight();
        self.renderer.abort_pass(self.pipeline.device_mut());
        self.state = StreamingState::Idle;
    }

    /// Abort any pass and destroy every chunk the renderer holds
    pub fn clear(&mut self) {
        self.stop();
        self.renderer.clear_chunks(self.pipeline.device_mut());
        log::info!("[ChunkStreamingController] Cleared all chunks");
    }

    /// Clear chunks and release the pipeline's shared resources
    pub fn release(&mut self) {
        self.clear();
        self.pipeline.release();
    }

    fn advance(&mut self) -> TerrainResult<StepStatus> {
        match self.state {
            StreamingState::Idle => Ok(StepStatus::Done),
            StreamingState::Running => {
                match self.config.count_mode {
                    CountMode::Blocking => self.step_blocking()?,
                    CountMode::Deferred => self.step_deferred()?,
                }
                self.update_renderer()?;
                if self.cursor >= self.coords.len() && self.in_flight.is_none() {
                    self.state = StreamingState::Draining;
                }
                Ok(StepStatus::Continue)
            }
            StreamingState::Draining => {
                self.update_renderer()?;
                if self.renderer.pending_count() > 0 {
                    return Ok(StepStatus::Continue);
                }
                self.finish_pass();
                Ok(StepStatus::Done)
            }
        }
    }

    fn next_coord(&self) -> Option<ChunkCoord> {
        self.coords.get(self.cursor).copied()
    }

    fn world_position(&self, coord: ChunkCoord) -> Vec3 {
        coord.world_position(self.config.chunk_size, self.config.center_offset)
    }

    fn step_blocking(&mut self) -> TerrainResult<()> {
        let Some(coord) = self.next_coord() else {
            return Ok(());
        };
        let output = self
            .pipeline
            .generate_chunk(self.world_position(coord), self.config.chunk_size)?;
        self.hand_off(coord, output)
    }

    /// At most one chunk in flight; its counter is polled once per step
    fn step_deferred(&mut self) -> TerrainResult<()> {
        if self.in_flight.is_none() {
            if let Some(coord) = self.next_coord() {
                let pending = self
                    .pipeline
                    .begin_chunk(self.world_position(coord), self.config.chunk_size)?;
                self.in_flight = Some((coord, pending));
            }
        }

        let ready = match self.in_flight.as_mut() {
            Some((_, pending)) => self.pipeline.poll_chunk(pending)?,
            None => return Ok(()),
        };
        if let Some(output) = ready {
            if let Some((coord, _)) = self.in_flight.take() {
                self.hand_off(coord, output)?;
            }
        }
        Ok(())
    }

    fn hand_off(&mut self, coord: ChunkCoord, output: ChunkOutput) -> TerrainResult<()> {
        self.renderer.add_chunk(
            self.pipeline.device_mut(),
            coord,
            &output.buffers,
            output.world_position,
            output.vertex_count,
        )?;

        self.cursor += 1;
        self.summary.chunks_generated += 1;
        self.summary.total_vertices += output.vertex_count;
        if output.overflow {
            self.summary.overflow_chunks += 1;
        }
        self.summary.chunk_vertex_counts.push((coord, output.vertex_count));

        log::debug!(
            "[ChunkStreamingController] Chunk {} ({}/{}): {} vertices in {:?}",
            coord,
            self.cursor,
            self.coords.len(),
            output.vertex_count,
            output.elapsed
        );
        Ok(())
    }

    fn update_renderer(&mut self) -> TerrainResult<usize> {
        let generation = self.pipeline.generation();
        self.renderer.update(self.pipeline.device_mut(), generation)
    }

    fn cancel_in_flight(&mut self) {
        if let Some((coord, pending)) = self.in_flight.take() {
            log::debug!("[ChunkStreamingController] Cancelling in-flight chunk {}", coord);
            self.pipeline.cancel_chunk(pending);
        }
    }

    fn finish_pass(&mut self) {
        self.renderer.commit_pass(self.pipeline.device_mut());
        self.state = StreamingState::Idle;
        if let Some(started) = self.pass_started.take() {
            self.summary.elapsed = started.elapsed();
        }
        log::info!(
            "[ChunkStreamingController] Pass around {} done: {} chunks, {} vertices, {} overflowed, {:?}",
            self.center,
            self.summary.chunks_generated,
            self.summary.total_vertices,
            self.summary.overflow_chunks,
            self.summary.elapsed
        );
    }
}

/// Step iterator over one streaming pass
///
/// Yields `Continue` until the pass is committed, then a final `Done`. An error ends
/// the iteration after being yielded.
pub struct StreamingPass<'a, D: ComputeDevice, R: ChunkRenderer<D>> {
    controller: &'a mut ChunkStreamingController<D, R>,
    finished: bool,
}

impl<'a, D: ComputeDevice, R: ChunkRenderer<D>> StreamingPass<'a, D, R> {
    pub fn controller(&self) -> &ChunkStreamingController<D, R> {
        self.controller
    }
}

impl<'a, D: ComputeDevice, R: ChunkRenderer<D>> Iterator for StreamingPass<'a, D, R> {
    type Item = TerrainResult<StepStatus>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.controller.step();
        if !matches!(result, Ok(StepStatus::Continue)) {
            self.finished = true;
        }
        Some(result)
    }
}

/// Chunks of one pass in visiting order; fails when any lies off the i32 lattice
fn pass_coords(center: ChunkCoord, load_radius: u32) -> TerrainResult<Vec<ChunkCoord>> {
    grid_offsets(load_radius)?
        .into_iter()
        .map(|(dx, dz)| {
            center.checked_offset(dx, 0, dz).ok_or_else(|| {
                TerrainError::invalid_config(
                    "center",
                    format!("load radius {} around {} overflows the chunk lattice", load_radius, center),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuDevice;
    use crate::renderer::IndirectChunkRenderer;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            chunk_size: 7,
            load_radius: 1,
            ..ChunkConfig::default()
        }
    }

    fn controller(config: ChunkConfig) -> ChunkStreamingController<CpuDevice, IndirectChunkRenderer> {
        let pipeline = ChunkPipeline::builtin(CpuDevice::new()).unwrap();
        let renderer = IndirectChunkRenderer::new(config.chunk_size);
        ChunkStreamingController::new(pipeline, renderer, config).unwrap()
    }

    #[test]
    fn test_step_when_idle_is_done() {
        let mut controller = controller(small_config());
        assert_eq!(controller.step().unwrap(), StepStatus::Done);
        assert_eq!(controller.state(), StreamingState::Idle);
    }

    #[test]
    fn test_visiting_order_x_outer_z_inner() {
        let mut controller = controller(small_config());
        let summary = controller.run_to_completion(ChunkCoord::new(10, 0, -3)).unwrap();

        let coords: Vec<ChunkCoord> = summary.chunk_vertex_counts.iter().map(|(c, _)| *c).collect();
        assert_eq!(coords[0], ChunkCoord::new(9, 0, -4));
        assert_eq!(coords[1], ChunkCoord::new(9, 0, -3));
        assert_eq!(coords[3], ChunkCoord::new(10, 0, -4));
        assert_eq!(coords[8], ChunkCoord::new(11, 0, -2));
    }

    #[test]
    fn test_start_requires_configuration() {
        let mut controller = controller(small_config());
        controller.release();
        assert!(matches!(
            controller.start(ChunkCoord::new(0, 0, 0)),
            Err(TerrainError::NotConfigured)
        ));
    }

    #[test]
    fn test_start_off_lattice_edge_is_rejected() {
        let mut controller = controller(small_config());
        controller.start(ChunkCoord::new(0, 0, 0)).unwrap();
        controller.step().unwrap();

        for center in [ChunkCoord::new(i32::MAX, 0, 0), ChunkCoord::new(0, 0, i32::MIN)] {
            assert!(matches!(
                controller.start(center),
                Err(TerrainError::InvalidConfig { .. })
            ));
        }
        // The running pass is untouched
        assert_eq!(controller.state(), StreamingState::Running);
        assert_eq!(controller.progress(), (1, 9));
        while controller.step().unwrap() == StepStatus::Continue {}
        assert_eq!(controller.chunk_count(), 9);

        let edge = ChunkCoord::new(i32::MAX - 1, 0, i32::MIN + 1);
        let coords = pass_coords(edge, 1).unwrap();
        assert_eq!(coords[0], ChunkCoord::new(i32::MAX - 2, 0, i32::MIN));
        assert_eq!(coords[8], ChunkCoord::new(i32::MAX, 0, i32::MIN + 2));
        controller.start(edge).unwrap();
        assert_eq!(controller.progress(), (0, 9));
        controller.stop();
    }

    #[test]
    fn test_iterator_ends_with_done() {
        let mut controller = controller(small_config());
        let statuses: Vec<StepStatus> = controller
            .start_streaming_pass(ChunkCoord::new(0, 0, 0))
            .unwrap()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(statuses.last(), Some(&StepStatus::Done));
        assert_eq!(
            statuses.iter().filter(|s| **s == StepStatus::Continue).count(),
            statuses.len() - 1
        );
        assert!(!controller.is_running());
    }
}
