//! Chunk renderers
//!
//! A renderer consumes the shared geometry buffers of each generated chunk before the
//! pipeline reuses them. Two variants exist: GPU-resident indirect draws, and async
//! readback into host meshes. Both keep a visible chunk set and a staging set so a
//! streaming pass replaces the visible set in one step.

pub mod indirect;
pub mod mesh;
pub mod readback;

pub use indirect::{IndirectChunkRenderer, IndirectDraw, IndirectDrawArgs};
pub use mesh::{ChunkMeshInstance, HostMesh};
pub use readback::{ReadbackChunkRenderer, ReadbackRequest, RequestState};

use glam::Vec3;
use rustc_hash::FxHashMap;

use crate::config::RendererKind;
use crate::error::TerrainResult;
use crate::gpu::{ComputeDevice, GeometryBufferSet};
use crate::world::ChunkCoord;

/// World-space box of one chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkBounds {
    pub center: Vec3,
    /// Full edge lengths
    pub size: Vec3,
}

impl ChunkBounds {
    pub fn from_chunk(world_position: Vec3, chunk_size: u32) -> Self {
        let size = Vec3::splat(chunk_size as f32);
        Self {
            center: world_position + size * 0.5,
            size,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.size * 0.5
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.size * 0.5
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min()).all() && point.cmple(self.max()).all()
    }
}

/// Visible chunks plus the set being built by the current pass
///
/// Removed entries are handed back to the caller, which owns their destruction.
#[derive(Debug)]
pub struct ActiveChunkSet<T> {
    visible: FxHashMap<ChunkCoord, T>,
    staging: Option<FxHashMap<ChunkCoord, T>>,
    epoch: u64,
}

impl<T> Default for ActiveChunkSet<T> {
    fn default() -> Self {
        Self {
            visible: FxHashMap::default(),
            staging: None,
            epoch: 0,
        }
    }
}

impl<T> ActiveChunkSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped whenever a pass opens, aborts, or the set is cleared
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Open a new staging set, discarding any previous uncommitted one
    pub fn begin(&mut self) -> Vec<T> {
        self.epoch += 1;
        let discarded = self.staging.replace(FxHashMap::default());
        discarded.map(|s| s.into_values().collect()).unwrap_or_default()
    }

    /// Insert into the staging set, or the visible set when no pass is open
    pub fn insert(&mut self, coord: ChunkCoord, item: T) -> Option<T> {
        match self.staging.as_mut() {
            Some(staging) => staging.insert(coord, item),
            None => self.visible.insert(coord, item),
        }
    }

    /// Promote the staging set; returns the previous visible entries
    pub fn commit(&mut self) -> Vec<T> {
        match self.staging.take() {
            Some(staging) => std::mem::replace(&mut self.visible, staging)
                .into_values()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop the staging set, keeping the visible one
    pub fn abort(&mut self) -> Vec<T> {
        self.epoch += 1;
        self.staging
            .take()
            .map(|s| s.into_values().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) -> Vec<T> {
        let mut removed = self.abort();
        removed.extend(self.visible.drain().map(|(_, v)| v));
        removed
    }

    pub fn get(&self, coord: &ChunkCoord) -> Option<&T> {
        self.visible.get(coord)
    }

    pub fn visible(&self) -> impl Iterator<Item = (&ChunkCoord, &T)> {
        self.visible.iter()
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn staged_len(&self) -> usize {
        self.staging.as_ref().map_or(0, |s| s.len())
    }
}

/// Consumer of generated chunk geometry
pub trait ChunkRenderer<D: ComputeDevice + ?Sized> {
    fn kind(&self) -> RendererKind;

    /// Logical chunk size used for bounds
    fn set_chunk_size(&mut self, chunk_size: u32);

    /// Open a staging set for a streaming pass
    fn begin_pass(&mut self, device: &mut D);

    /// Take over one chunk's geometry before the shared buffers are reused
    fn add_chunk(
        &mut self,
        device: &mut D,
        coord: ChunkCoord,
        geometry: &GeometryBufferSet,
        world_position: Vec3,
        vertex_count: u64,
    ) -> TerrainResult<()>;

    /// Advance outstanding work; returns how many chunks completed
    fn update(&mut self, device: &mut D, live_generation: u64) -> TerrainResult<usize>;

    /// Chunks added but not yet renderable
    fn pending_count(&self) -> usize;

    /// Replace the visible set with the staging set
    fn commit_pass(&mut self, device: &mut D);

    /// Discard the staging set and its outstanding work
    fn abort_pass(&mut self, device: &mut D);

    /// Destroy every chunk and outstanding request
    fn clear_chunks(&mut self, device: &mut D);

    /// Visible chunks
    fn chunk_count(&self) -> usize;

    fn pass_epoch(&self) -> u64;
}

impl<D, R> ChunkRenderer<D> for Box<R>
where
    D: ComputeDevice + ?Sized,
    R: ChunkRenderer<D> + ?Sized,
{
    fn kind(&self) -> RendererKind {
        (**self).kind()
    }

    fn set_chunk_size(&mut self, chunk_size: u32) {
        (**self).set_chunk_size(chunk_size)
    }

    fn begin_pass(&mut self, device: &mut D) {
        (**self).begin_pass(device)
    }

    fn add_chunk(
        &mut self,
        device: &mut D,
        coord: ChunkCoord,
        geometry: &GeometryBufferSet,
        world_position: Vec3,
        vertex_count: u64,
    ) -> TerrainResult<()> {
        (**self).add_chunk(device, coord, geometry, world_position, vertex_count)
    }

    fn update(&mut self, device: &mut D, live_generation: u64) -> TerrainResult<usize> {
        (**self).update(device, live_generation)
    }

    fn pending_count(&self) -> usize {
        (**self).pending_count()
    }

    fn commit_pass(&mut self, device: &mut D) {
        (**self).commit_pass(device)
    }

    fn abort_pass(&mut self, device: &mut D) {
        (**self).abort_pass(device)
    }

    fn clear_chunks(&mut self, device: &mut D) {
        (**self).clear_chunks(device)
    }

    fn chunk_count(&self) -> usize {
        (**self).chunk_count()
    }

    fn pass_epoch(&self) -> u64 {
        (**self).pass_epoch()
    }
}

pub fn create_renderer<D: ComputeDevice + ?Sized + 'static>(
    kind: RendererKind,
    chunk_size: u32,
) -> Box<dyn ChunkRenderer<D>> {
    match kind {
        RendererKind::Indirect => Box::new(IndirectChunkRenderer::new(chunk_size)),
        RendererKind::Readback => Box::new(ReadbackChunkRenderer::new(chunk_size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_from_chunk() {
        let bounds = ChunkBounds::from_chunk(Vec3::new(-8.0, 0.0, 8.0), 8);
        assert_eq!(bounds.center, Vec3::new(-4.0, 4.0, 12.0));
        assert!(bounds.contains(Vec3::new(-8.0, 0.0, 8.0)));
        assert!(!bounds.contains(Vec3::new(0.5, 4.0, 12.0)));
    }

    #[test]
    fn test_commit_replaces_visible_set() {
        let mut set = ActiveChunkSet::new();
        set.insert(ChunkCoord::new(0, 0, 0), "old");

        set.begin();
        set.insert(ChunkCoord::new(1, 0, 0), "new");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&ChunkCoord::new(0, 0, 0)), Some(&"old"));

        let removed = set.commit();
        assert_eq!(removed, vec!["old"]);
        assert_eq!(set.get(&ChunkCoord::new(1, 0, 0)), Some(&"new"));
        assert!(!set.is_staging());
    }

    #[test]
    fn test_abort_keeps_visible_set() {
        let mut set = ActiveChunkSet::new();
        set.insert(ChunkCoord::new(0, 0, 0), 1);
        let epoch = set.epoch();

        set.begin();
        set.insert(ChunkCoord::new(2, 0, 0), 2);
        assert_eq!(set.abort(), vec![2]);
        assert!(set.epoch() > epoch);
        assert_eq!(set.len(), 1);

        assert_eq!(set.clear(), vec![1]);
        assert!(set.is_empty());
    }
}
