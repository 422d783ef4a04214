//! Full generation pipeline on the software backend

use glam::{UVec3, Vec3};
use isoterrain::constants::{kernels, slots};
use isoterrain::generation::StageKind;
use isoterrain::gpu::allocator::{check_capacity, vertex_capacity};
use isoterrain::gpu::cpu_device::{KernelInvocation, SoftwareKernel};
use isoterrain::gpu::shaders::ShaderLibrary;
use isoterrain::gpu::{BufferAllocator, ComputeDevice};
use isoterrain::{ChunkConfig, ChunkPipeline, CpuDevice, TerrainError, TerrainResult};

fn config(chunk_size: u32) -> ChunkConfig {
    ChunkConfig {
        chunk_size,
        ..ChunkConfig::default()
    }
}

fn configured(device: CpuDevice, config: ChunkConfig) -> ChunkPipeline<CpuDevice> {
    let mut pipeline = ChunkPipeline::builtin(device).unwrap();
    pipeline.configure(config).unwrap();
    pipeline
}

/// Density kernel writing the same value everywhere
fn constant_density(device: &mut CpuDevice, value: f32) {
    device.register_kernel(
        kernels::NOISE_3D,
        move |ctx: &mut KernelInvocation, id: UVec3| -> TerrainResult<()> {
            ctx.store_texel(slots::NOISE_TEXTURE, id.to_array(), [value, 0.0, 0.0, 0.0])
        },
    );
}

/// Density kernel with a single inside sample at the volume corner
fn corner_density(device: &mut CpuDevice) {
    device.register_kernel(
        kernels::NOISE_3D,
        |ctx: &mut KernelInvocation, id: UVec3| -> TerrainResult<()> {
            let value = if id == UVec3::ZERO { -1.0 } else { 1.0 };
            ctx.store_texel(slots::NOISE_TEXTURE, id.to_array(), [value, 0.0, 0.0, 0.0])
        },
    );
}

/// Isosurface kernel reporting far more triangles than fit
struct OverflowingExtraction {
    triangles: u32,
}

impl SoftwareKernel for OverflowingExtraction {
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        ctx.atomic_add("verticesCounter", self.triangles)?;
        Ok(())
    }
}

#[test]
fn test_vertex_count_is_multiple_of_three() {
    let mut pipeline = configured(CpuDevice::new(), config(15));

    for position in [Vec3::ZERO, Vec3::new(15.0, -15.0, 30.0), Vec3::new(-45.0, 0.0, 0.0)] {
        let output = pipeline.generate_chunk(position, 15).unwrap();
        assert_eq!(output.vertex_count % 3, 0);
        assert!(output.vertex_count <= output.buffers.vertex_capacity);
        assert!(!output.overflow);
    }
    assert_eq!(pipeline.stats().chunks_generated, 3);
}

#[test]
fn test_identical_config_is_deterministic() {
    let mut a = configured(CpuDevice::new(), config(7));
    let mut b = configured(CpuDevice::new(), config(7));
    let position = Vec3::new(7.0, -7.0, 0.0);

    let out_a = a.generate_chunk(position, 7).unwrap();
    let out_b = b.generate_chunk(position, 7).unwrap();
    assert_eq!(out_a.vertex_count, out_b.vertex_count);
    assert_eq!(a.read_geometry(&out_a).unwrap(), b.read_geometry(&out_b).unwrap());
}

#[test]
fn test_uniform_density_produces_no_geometry() {
    for value in [1.0, -1.0] {
        let mut device = CpuDevice::new();
        constant_density(&mut device, value);
        let mut pipeline = configured(device, config(7));

        let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
        assert_eq!(output.vertex_count, 0, "density {}", value);
        let (vertices, normals) = pipeline.read_geometry(&output).unwrap();
        assert!(vertices.is_empty() && normals.is_empty());
    }
}

#[test]
fn test_single_sign_change_produces_one_cell() {
    let mut device = CpuDevice::new();
    corner_density(&mut device);
    let mut pipeline = configured(device, config(7));

    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
    assert!((3..=15).contains(&output.vertex_count));

    let (vertices, normals) = pipeline.read_geometry(&output).unwrap();
    assert_eq!(vertices.len() as u64, output.vertex_count);
    assert_eq!(vertices.len(), normals.len());
    // Every vertex sits halfway along an edge leaving the corner
    for v in &vertices {
        let p = Vec3::new(v[0], v[1], v[2]);
        assert!((p.length() - 0.5).abs() < 1e-5, "vertex {:?}", p);
    }
}

#[test]
fn test_capacity_boundary() {
    let capacity = vertex_capacity(8, 1);
    assert_eq!(capacity, 7680);
    assert!(check_capacity(7680, capacity).is_ok());
    assert!(matches!(
        check_capacity(7681, capacity),
        Err(TerrainError::CapacityExceeded {
            reported: 7681,
            capacity: 7680
        })
    ));
}

#[test]
fn test_overflow_is_clamped_and_flagged() {
    let mut device = CpuDevice::new();
    device.register_kernel(kernels::ISOSURFACE_EXTRACT, OverflowingExtraction { triangles: 5000 });
    let mut pipeline = configured(device, config(7));

    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
    assert!(output.overflow);
    assert_eq!(output.vertex_count, output.buffers.vertex_capacity);
    assert_eq!(output.vertex_count % 3, 0);
    assert_eq!(pipeline.stats().overflow_count, 1);
}

#[test]
fn test_release_is_idempotent() {
    let mut device = CpuDevice::new();
    let mut allocator = BufferAllocator::new();
    allocator.release(&mut device);
    assert_eq!(allocator.generation(), 0);

    allocator.allocate(&mut device, 8, 1, 1).unwrap();
    allocator.release(&mut device);
    let generation = allocator.generation();
    allocator.release(&mut device);
    assert_eq!(allocator.generation(), generation);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_volume_count(), 0);

    let mut pipeline = configured(CpuDevice::new(), config(7));
    pipeline.release();
    pipeline.release();
    assert_eq!(pipeline.device().live_buffer_count(), 0);
    assert!(matches!(
        pipeline.generate_chunk(Vec3::ZERO, 7),
        Err(TerrainError::NotConfigured)
    ));
}

#[test]
fn test_reconfigure_reallocates_and_bumps_generation() {
    let mut pipeline = configured(CpuDevice::new(), config(7));
    let first = pipeline.generation();
    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();

    // Same sizing: buffers are kept
    let mut same = config(7);
    same.noise.seed = 3.0;
    pipeline.configure(same).unwrap();
    assert_eq!(pipeline.generation(), first);

    pipeline.configure(config(15)).unwrap();
    assert!(pipeline.generation() > first);
    assert!(matches!(
        pipeline.read_geometry(&output),
        Err(TerrainError::StaleGeneration { .. })
    ));
    assert!(matches!(
        pipeline.generate_chunk(Vec3::ZERO, 7),
        Err(TerrainError::ConfigMismatch {
            configured: 15,
            requested: 7
        })
    ));
}

#[test]
fn test_non_integral_dispatch_rejected_at_configure() {
    let mut pipeline = ChunkPipeline::builtin(CpuDevice::new()).unwrap();
    assert!(matches!(
        pipeline.configure(config(8)),
        Err(TerrainError::NonIntegralDispatch { .. })
    ));
    assert!(pipeline.config().is_none());
}

#[test]
fn test_deferred_count_matches_blocking() {
    let mut device = CpuDevice::new();
    device.set_transfer_latency(3);
    let mut pipeline = configured(device, config(7));
    let position = Vec3::new(0.0, -7.0, 0.0);

    let blocking = pipeline.generate_chunk(position, 7).unwrap();

    let mut pending = pipeline.begin_chunk(position, 7).unwrap();
    let mut polls = 0;
    let deferred = loop {
        polls += 1;
        if let Some(output) = pipeline.poll_chunk(&mut pending).unwrap() {
            break output;
        }
    };
    assert_eq!(polls, 3);
    assert_eq!(deferred.vertex_count, blocking.vertex_count);
}

#[test]
fn test_copy_stage_writes_sequential_triangles() {
    let mut device = CpuDevice::new();
    corner_density(&mut device);
    let mut pipeline = configured(
        device,
        ChunkConfig {
            copy_mesh_buffers: true,
            ..config(7)
        },
    );

    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
    assert_eq!(output.triangle_count(), 1);
    let bytes = pipeline
        .device_mut()
        .read_buffer(output.buffers.triangles, 0, 16)
        .unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2, 0]).to_vec());
}

#[test]
fn test_out_of_memory_propagates() {
    let mut device = CpuDevice::new();
    device.set_memory_budget(Some(1024));
    let mut pipeline = ChunkPipeline::builtin(device).unwrap();
    let err = pipeline.configure(config(7)).unwrap_err();
    assert!(err.is_resource_exhaustion());
    assert_eq!(pipeline.device().memory_used(), 0);
}

#[test]
fn test_missing_required_kernel_aborts_construction() {
    let library = ShaderLibrary::builtin().unwrap();
    let density = &library.density;
    let normals = &library.normals;
    let isosurface = &library.isosurface;
    let copy = Some(&library.copy_mesh);

    // Each required stage in turn gets a program without its entry point
    let cases = [
        (normals, normals, isosurface, kernels::NOISE_3D),
        (density, density, isosurface, kernels::NORMAL_ESTIMATE),
        (density, normals, normals, kernels::ISOSURFACE_EXTRACT),
    ];
    for (d, n, i, missing) in cases {
        let result = ChunkPipeline::with_programs(CpuDevice::new(), d, n, i, copy);
        match result {
            Err(TerrainError::KernelNotFound { kernel, .. }) => assert_eq!(kernel, missing),
            Err(e) => panic!("expected KernelNotFound for {}, got {}", missing, e),
            Ok(_) => panic!("pipeline built without {}", missing),
        }
    }
}

#[test]
fn test_missing_copy_kernel_only_disables_copy_stage() {
    let library = ShaderLibrary::builtin().unwrap();
    let mut pipeline = ChunkPipeline::with_programs(
        CpuDevice::new(),
        &library.density,
        &library.normals,
        &library.isosurface,
        Some(&library.normals),
    )
    .unwrap();
    assert!(pipeline.stage(StageKind::CopyMesh).is_none());
    assert!(pipeline.stage(StageKind::IsoSurface).is_some());

    assert!(matches!(
        pipeline.configure(ChunkConfig {
            copy_mesh_buffers: true,
            ..config(7)
        }),
        Err(TerrainError::InvalidConfig { .. })
    ));

    // Generation without the copy stage still works
    pipeline.configure(config(7)).unwrap();
    let output = pipeline.generate_chunk(Vec3::ZERO, 7).unwrap();
    assert_eq!(output.vertex_count % 3, 0);
}
