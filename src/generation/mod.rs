//! Chunk generation: compute stages and the pipeline that orders them

pub mod pipeline;
pub mod stages;

pub use pipeline::{ChunkOutput, ChunkPipeline, PendingChunk, PipelineStats};
pub use stages::{ComputeStage, StageKind};
