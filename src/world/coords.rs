use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::constants::chunk::MAX_LOAD_RADIUS;
use crate::error::{TerrainError, TerrainResult};

/// Position of a chunk on the integer chunk lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// World-space origin of the chunk: coordinate * chunk size + center offset
    pub fn world_position(&self, chunk_size: u32, center_offset: Vec3) -> Vec3 {
        let size = chunk_size as f32;
        Vec3::new(
            self.x as f32 * size,
            self.y as f32 * size,
            self.z as f32 * size,
        ) + center_offset
    }

    /// Chunk containing a world-space point
    pub fn from_world_pos(pos: Vec3, chunk_size: u32, center_offset: Vec3) -> Self {
        let local = (pos - center_offset) / chunk_size as f32;
        Self::new(
            local.x.floor() as i32,
            local.y.floor() as i32,
            local.z.floor() as i32,
        )
    }

    /// Coordinate offset by the given amounts, or `None` if any axis leaves the i32 range
    pub fn checked_offset(&self, dx: i32, dy: i32, dz: i32) -> Option<Self> {
        Some(Self::new(
            self.x.checked_add(dx)?,
            self.y.checked_add(dy)?,
            self.z.checked_add(dz)?,
        ))
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Horizontal load offsets around a center chunk, x outer and z inner
pub fn grid_offsets(radius: u32) -> TerrainResult<Vec<(i32, i32)>> {
    let too_large = || {
        TerrainError::invalid_config(
            "load_radius",
            format!("must be at most {}, got {}", MAX_LOAD_RADIUS, radius),
        )
    };
    if radius > MAX_LOAD_RADIUS {
        return Err(too_large());
    }
    let r = i32::try_from(radius).map_err(|_| too_large())?;
    let count = (radius as usize)
        .checked_mul(2)
        .and_then(|d| d.checked_add(1))
        .and_then(|side| side.checked_mul(side))
        .ok_or_else(too_large)?;

    let mut offsets = Vec::with_capacity(count);
    for x in -r..=r {
        for z in -r..=r {
            offsets.push((x, z));
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_position_applies_offset() {
        let coord = ChunkCoord::new(1, -1, 2);
        let pos = coord.world_position(8, Vec3::new(0.5, 0.0, -4.0));
        assert_eq!(pos, Vec3::new(8.5, -8.0, 12.0));
    }

    #[test]
    fn test_from_world_pos_floors_negative() {
        let coord = ChunkCoord::from_world_pos(Vec3::new(-0.1, 7.9, 8.0), 8, Vec3::ZERO);
        assert_eq!(coord, ChunkCoord::new(-1, 0, 1));
    }

    #[test]
    fn test_grid_offsets_order() {
        let offsets = grid_offsets(1).unwrap();
        assert_eq!(offsets.len(), 9);
        assert_eq!(offsets[0], (-1, -1));
        assert_eq!(offsets[1], (-1, 0));
        assert_eq!(offsets[3], (0, -1));
        assert_eq!(offsets[8], (1, 1));

        assert_eq!(grid_offsets(0).unwrap(), vec![(0, 0)]);
    }

    #[test]
    fn test_grid_offsets_rejects_huge_radius() {
        let side = 2 * MAX_LOAD_RADIUS as usize + 1;
        assert_eq!(grid_offsets(MAX_LOAD_RADIUS).unwrap().len(), side * side);

        for radius in [MAX_LOAD_RADIUS + 1, 40_000, u32::MAX] {
            assert!(matches!(
                grid_offsets(radius),
                Err(TerrainError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn test_checked_offset_at_lattice_edge() {
        let edge = ChunkCoord::new(i32::MAX, 0, i32::MIN);
        assert_eq!(edge.checked_offset(0, 0, 0), Some(edge));
        assert_eq!(
            edge.checked_offset(-1, 2, 1),
            Some(ChunkCoord::new(i32::MAX - 1, 2, i32::MIN + 1))
        );
        assert_eq!(edge.checked_offset(1, 0, 0), None);
        assert_eq!(edge.checked_offset(0, 0, -1), None);
    }
}
