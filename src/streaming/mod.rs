//! Chunk streaming around a moving center
//!
//! The controller is a resumable step object: a host loop calls `step()` once per
//! frame, tooling calls `run_to_completion()`.

pub mod controller;

pub use controller::{
    ChunkStreamingController, PassSummary, StepStatus, StreamingPass, StreamingState,
};
