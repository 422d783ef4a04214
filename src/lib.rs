//! GPU voxel terrain: density field, normals and marching cubes extraction per
//! chunk, streamed around a center chunk into an indirect-draw or host-mesh renderer.

pub mod config;
pub mod constants;
pub mod error;
pub mod generation;
pub mod gpu;
pub mod renderer;
pub mod streaming;
pub mod world;

pub use config::{ChunkConfig, CountMode, NoiseParams, RendererKind};
pub use error::{TerrainError, TerrainResult};
pub use generation::{ChunkOutput, ChunkPipeline, PipelineStats};
pub use gpu::{ComputeDevice, CpuDevice, GeometryBufferSet, WgpuDevice};
pub use renderer::{
    create_renderer, ChunkRenderer, HostMesh, IndirectChunkRenderer, ReadbackChunkRenderer,
};
pub use streaming::{ChunkStreamingController, PassSummary, StepStatus, StreamingState};
pub use world::ChunkCoord;
