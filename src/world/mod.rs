//! World-space chunk addressing

mod coords;

pub use coords::{grid_offsets, ChunkCoord};
