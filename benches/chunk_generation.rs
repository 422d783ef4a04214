use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;

use isoterrain::{ChunkConfig, ChunkCoord, ChunkPipeline, ChunkStreamingController, CpuDevice};

fn config(chunk_size: u32) -> ChunkConfig {
    ChunkConfig {
        chunk_size,
        ..ChunkConfig::default()
    }
}

/// One chunk through density, normals and extraction on the software backend
fn bench_generate_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_chunk");
    group.sample_size(20);

    for chunk_size in [7u32, 15] {
        let mut pipeline = ChunkPipeline::builtin(CpuDevice::new()).unwrap();
        pipeline.configure(config(chunk_size)).unwrap();
        let position = Vec3::new(0.0, -(chunk_size as f32) * 0.5, 0.0);

        group.bench_function(format!("cpu_{}", chunk_size), |b| {
            b.iter(|| {
                let output = pipeline.generate_chunk(black_box(position), chunk_size).unwrap();
                black_box(output.vertex_count)
            })
        });
    }
    group.finish();
}

/// Full radius-1 streaming pass into host meshes
fn bench_streaming_pass(c: &mut Criterion) {
    let mut controller = ChunkStreamingController::builtin(CpuDevice::new(), config(7)).unwrap();

    c.bench_function("streaming_pass_radius_1", |b| {
        b.iter(|| {
            let summary = controller
                .run_to_completion(black_box(ChunkCoord::new(0, 0, 0)))
                .unwrap();
            black_box(summary.total_vertices)
        })
    });
}

criterion_group!(benches, bench_generate_chunk, bench_streaming_pass);
criterion_main!(benches);
