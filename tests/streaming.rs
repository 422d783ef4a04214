//! Streaming passes on the software backend with both renderers

use glam::{UVec3, Vec3};
use isoterrain::constants::{kernels, slots};
use isoterrain::gpu::cpu_device::KernelInvocation;
use isoterrain::gpu::GeometryBufferSet;
use isoterrain::renderer::{ReadbackRequest, RequestState};
use isoterrain::{
    ChunkConfig, ChunkCoord, ChunkPipeline, ChunkStreamingController, CountMode, CpuDevice,
    IndirectChunkRenderer, ReadbackChunkRenderer, RendererKind, StepStatus, StreamingState,
    TerrainError, TerrainResult,
};

fn config(count_mode: CountMode) -> ChunkConfig {
    ChunkConfig {
        chunk_size: 7,
        load_radius: 1,
        count_mode,
        ..ChunkConfig::default()
    }
}

/// Device whose density has one inside sample per chunk, so every chunk has 3 vertices
fn corner_device() -> CpuDevice {
    let mut device = CpuDevice::new();
    device.register_kernel(
        kernels::NOISE_3D,
        |ctx: &mut KernelInvocation, id: UVec3| -> TerrainResult<()> {
            let value = if id == UVec3::ZERO { -1.0 } else { 1.0 };
            ctx.store_texel(slots::NOISE_TEXTURE, id.to_array(), [value, 0.0, 0.0, 0.0])
        },
    );
    device
}

fn readback_controller(
    device: CpuDevice,
    config: ChunkConfig,
) -> ChunkStreamingController<CpuDevice, ReadbackChunkRenderer> {
    let pipeline = ChunkPipeline::builtin(device).unwrap();
    ChunkStreamingController::new(pipeline, ReadbackChunkRenderer::new(config.chunk_size), config).unwrap()
}

fn indirect_controller(
    device: CpuDevice,
    config: ChunkConfig,
) -> ChunkStreamingController<CpuDevice, IndirectChunkRenderer> {
    let pipeline = ChunkPipeline::builtin(device).unwrap();
    ChunkStreamingController::new(pipeline, IndirectChunkRenderer::new(config.chunk_size), config).unwrap()
}

#[test]
fn test_radius_one_visits_nine_chunks_then_idles() {
    let mut controller = readback_controller(CpuDevice::new(), config(CountMode::Blocking));
    let summary = controller.run_to_completion(ChunkCoord::new(0, 0, 0)).unwrap();

    assert_eq!(summary.chunks_generated, 9);
    assert_eq!(summary.chunk_vertex_counts.len(), 9);
    assert_eq!(controller.state(), StreamingState::Idle);
    assert_eq!(controller.progress(), (9, 9));
    assert_eq!(controller.renderer().meshes().count(), 9);
    assert_eq!(controller.step().unwrap(), StepStatus::Done);
}

#[test]
fn test_readback_meshes_match_generated_counts() {
    let mut controller = readback_controller(corner_device(), config(CountMode::Blocking));
    let summary = controller.run_to_completion(ChunkCoord::new(2, 0, 2)).unwrap();
    assert_eq!(summary.total_vertices, 27);

    for (coord, vertices) in &summary.chunk_vertex_counts {
        let instance = controller.renderer().chunk(coord).unwrap();
        assert_eq!(instance.mesh.vertex_count() as u64, *vertices);
        assert_eq!(instance.mesh.indices, vec![0, 1, 2]);
        assert_eq!(instance.world_position, coord.world_position(7, Vec3::ZERO));
        assert!(instance.bounds.contains(instance.world_position));
    }
}

#[test]
fn test_deferred_counts_with_transfer_latency() {
    let mut device = corner_device();
    device.set_transfer_latency(3);
    let mut controller = readback_controller(device, config(CountMode::Deferred));

    let summary = controller.run_to_completion(ChunkCoord::new(0, 0, 0)).unwrap();
    assert_eq!(summary.chunks_generated, 9);
    assert_eq!(summary.total_vertices, 27);
    // Counter polls and mesh readbacks both take several steps
    assert!(summary.steps > 9 * 3);
    assert_eq!(controller.renderer().meshes().count(), 9);
    assert_eq!(controller.pipeline().device().pending_transfer_count(), 0);
}

#[test]
fn test_restart_begins_from_first_offset() {
    let mut controller = readback_controller(corner_device(), config(CountMode::Blocking));
    controller.start(ChunkCoord::new(0, 0, 0)).unwrap();
    for _ in 0..4 {
        controller.step().unwrap();
    }
    assert_eq!(controller.progress(), (4, 9));

    controller.start(ChunkCoord::new(5, 0, 5)).unwrap();
    assert_eq!(controller.progress(), (0, 9));
    while controller.step().unwrap() == StepStatus::Continue {}

    assert_eq!(controller.summary().chunks_generated, 9);
    assert_eq!(controller.renderer().meshes().count(), 9);
    assert!(controller.renderer().chunk(&ChunkCoord::new(0, 0, 0)).is_none());
    assert!(controller.renderer().chunk(&ChunkCoord::new(5, 0, 5)).is_some());
}

#[test]
fn test_restart_with_pending_readbacks_discards_them() {
    let mut device = corner_device();
    device.set_transfer_latency(5);
    let mut controller = readback_controller(device, config(CountMode::Blocking));

    controller.start(ChunkCoord::new(0, 0, 0)).unwrap();
    controller.step().unwrap();
    controller.step().unwrap();
    assert!(!controller.renderer().pending().is_empty());

    controller.start(ChunkCoord::new(0, 0, 0)).unwrap();
    assert!(controller.renderer().pending().is_empty());
    while controller.step().unwrap() == StepStatus::Continue {}
    assert_eq!(controller.summary().chunks_generated, 9);
    assert_eq!(controller.renderer().meshes().count(), 9);
}

#[test]
fn test_failed_pass_keeps_previous_chunks() {
    let mut controller = indirect_controller(corner_device(), config(CountMode::Blocking));
    controller.run_to_completion(ChunkCoord::new(0, 0, 0)).unwrap();
    assert_eq!(controller.renderer().draws().len(), 9);

    // No room for the next pass's chunk buffers
    let (_, device) = controller.renderer_and_device();
    let used = device.memory_used();
    device.set_memory_budget(Some(used));

    let err = controller.run_to_completion(ChunkCoord::new(3, 0, 3)).unwrap_err();
    assert!(matches!(err, TerrainError::OutOfMemory { .. }));
    assert_eq!(controller.state(), StreamingState::Idle);

    let draws = controller.renderer().draws();
    assert_eq!(draws.len(), 9);
    assert!(draws.iter().all(|d| d.vertex_count == 3));
    assert!(controller.renderer().chunk(&ChunkCoord::new(-1, 0, 1)).is_some());
}

#[test]
fn test_indirect_pass_replaces_chunk_buffers() {
    let mut controller = indirect_controller(corner_device(), config(CountMode::Blocking));
    controller.run_to_completion(ChunkCoord::new(0, 0, 0)).unwrap();
    let after_first = controller.pipeline().device().live_buffer_count();

    controller.run_to_completion(ChunkCoord::new(1, 0, 0)).unwrap();
    assert_eq!(controller.pipeline().device().live_buffer_count(), after_first);

    controller.clear();
    assert!(controller.renderer().draws().is_empty());
    // Only the shared pipeline buffers remain
    assert_eq!(controller.pipeline().device().live_buffer_count(), after_first - 9 * 3);

    controller.release();
    assert_eq!(controller.pipeline().device().live_buffer_count(), 0);
}

#[test]
fn test_builtin_controller_uses_configured_renderer() {
    let config = ChunkConfig {
        renderer: RendererKind::Indirect,
        ..config(CountMode::Deferred)
    };
    let mut controller = ChunkStreamingController::builtin(corner_device(), config).unwrap();
    assert_eq!(controller.renderer_kind(), RendererKind::Indirect);

    let statuses: Vec<StepStatus> = controller
        .start_streaming_pass(ChunkCoord::new(0, 0, 0))
        .unwrap()
        .collect::<TerrainResult<_>>()
        .unwrap();
    assert_eq!(statuses.last(), Some(&StepStatus::Done));
    assert_eq!(controller.chunk_count(), 9);
}

#[test]
fn test_readback_request_waits_for_both_transfers() {
    let mut pipeline = ChunkPipeline::builtin(corner_device()).unwrap();
    pipeline.configure(config(CountMode::Blocking)).unwrap();
    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
    let geometry: GeometryBufferSet = output.buffers;

    pipeline.device_mut().set_transfer_latency(2);
    let mut request = ReadbackRequest::begin(
        pipeline.device_mut(),
        ChunkCoord::new(0, 0, 0),
        &geometry,
        Vec3::ZERO,
        output.vertex_count,
        0,
    )
    .unwrap();
    assert_eq!(request.state(), RequestState::Pending);
    assert!(!request.update(pipeline.device_mut()).unwrap());
    assert!(!request.is_done());
    assert!(request.take_mesh().is_none());

    assert!(request.update(pipeline.device_mut()).unwrap());
    assert!(request.is_done());
    assert_eq!(request.take_mesh().unwrap().vertex_count(), 3);
    assert_eq!(request.state(), RequestState::Consumed);
    assert_eq!(pipeline.device().pending_transfer_count(), 0);
}
