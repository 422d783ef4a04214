//! Streams one pass of terrain chunks around the origin and reports what was generated
//!
//! Usage: terrain_stream [config.toml] [center_x center_z]

use anyhow::{Context, Result};
use isoterrain::{
    ChunkConfig, ChunkCoord, ChunkStreamingController, ComputeDevice, CpuDevice, TerrainError,
    WgpuDevice,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.first() {
        Some(path) => ChunkConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => ChunkConfig::default(),
    };
    let center = match (args.get(1), args.get(2)) {
        (Some(x), Some(z)) => ChunkCoord::new(
            x.parse().context("center_x must be an integer")?,
            0,
            z.parse().context("center_z must be an integer")?,
        ),
        _ => ChunkCoord::new(0, 0, 0),
    };

    match WgpuDevice::request_blocking() {
        Ok(device) => stream(device, config, center),
        Err(TerrainError::DeviceUnavailable { reason }) => {
            log::warn!("No GPU adapter ({}), falling back to the software backend", reason);
            stream(CpuDevice::new(), config, center)
        }
        Err(e) => Err(e.into()),
    }
}

fn stream<D: ComputeDevice + 'static>(device: D, config: ChunkConfig, center: ChunkCoord) -> Result<()> {
    log::info!(
        "Streaming on {} backend: chunk size {}, load radius {}, {:?} renderer",
        device.backend_name(),
        config.chunk_size,
        config.load_radius,
        config.renderer
    );

    let mut controller = ChunkStreamingController::builtin(device, config)
        .context("creating streaming controller")?;
    let summary = controller
        .run_to_completion(center)
        .context("streaming pass failed")?;

    for (coord, vertices) in &summary.chunk_vertex_counts {
        log::info!("Chunk {}: {} vertices ({} triangles)", coord, vertices, vertices / 3);
    }
    log::info!(
        "Pass done: {} chunks, {} vertices, {} overflowed, {} steps in {:?}",
        summary.chunks_generated,
        summary.total_vertices,
        summary.overflow_chunks,
        summary.steps,
        summary.elapsed
    );

    let stats = controller.pipeline().stats();
    if stats.chunks_generated > 0 {
        log::info!(
            "Average {:.1} vertices per chunk, last chunk took {:?}",
            stats.total_vertices as f64 / stats.chunks_generated as f64,
            stats.last_elapsed
        );
    }

    controller.release();
    Ok(())
}
