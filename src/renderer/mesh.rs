use glam::Vec3;

use crate::renderer::ChunkBounds;
use crate::world::ChunkCoord;

/// Triangle soup assembled on the host from a chunk readback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    /// Sequential: triangle `t` uses vertices 3t, 3t+1, 3t+2
    pub indices: Vec<u32>,
}

impl HostMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parallel vec4 position and normal arrays; w is dropped
    pub fn from_soup(vertices: &[[f32; 4]], normals: &[[f32; 4]]) -> Self {
        let count = vertices.len().min(normals.len());
        let count = count - count % 3;
        Self {
            positions: vertices[..count].iter().map(|v| [v[0], v[1], v[2]]).collect(),
            normals: normals[..count].iter().map(|n| [n[0], n[1], n[2]]).collect(),
            indices: (0..count as u32).collect(),
        }
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.normals.clear();
        self.indices.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned bounds of the vertex positions, in mesh-local space
    pub fn local_bounds(&self) -> Option<(Vec3, Vec3)> {
        let mut iter = self.positions.iter().map(|p| Vec3::from_array(*p));
        let first = iter.next()?;
        Some(iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p))))
    }
}

/// A host mesh placed in the world
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeshInstance {
    pub coord: ChunkCoord,
    pub world_position: Vec3,
    pub bounds: ChunkBounds,
    pub mesh: HostMesh,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_soup_sequential_indices() {
        let vertices = [[0.0, 0.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 2.0, 1.0]];
        let normals = [[0.0, 1.0, 0.0, 0.0]; 3];
        let mesh = HostMesh::from_soup(&vertices, &normals);

        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.normals[2], [0.0, 1.0, 0.0]);
        assert_eq!(
            mesh.local_bounds(),
            Some((Vec3::ZERO, Vec3::new(1.0, 1.0, 2.0)))
        );
    }

    #[test]
    fn test_partial_triangles_dropped() {
        let vertices = [[0.0; 4]; 4];
        let normals = [[0.0; 4]; 4];
        assert_eq!(HostMesh::from_soup(&vertices, &normals).vertex_count(), 3);
        assert!(HostMesh::new().local_bounds().is_none());
    }
}
