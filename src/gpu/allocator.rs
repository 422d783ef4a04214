//! Worst-case buffer sizing and the lifetime of the shared chunk resources
//!
//! One set of geometry buffers and volumes serves every chunk of a pass. Capacities
//! come from the marching cubes worst case, never from actual output.

use crate::constants::chunk::VOLUME_PADDING;
use crate::constants::layout::*;
use crate::constants::marching_cubes::{MAX_TRIANGLES_PER_VOXEL, MAX_VERTICES_PER_VOXEL};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{
    BufferDescriptor, BufferId, BufferKind, ComputeDevice, CounterUnit, GeometryBufferSet,
    VolumeDescriptor, VolumeFormat, VolumeId, VolumeSet,
};

/// Vertex slots needed for the worst case: chunk_size^3 * 15 * resolution_per_voxel
pub fn vertex_capacity(chunk_size: u32, resolution_per_voxel: u32) -> u64 {
    voxel_count(chunk_size) * MAX_VERTICES_PER_VOXEL * resolution_per_voxel as u64
}

/// Triangle slots for the worst case: chunk_size^3 * 5 * resolution_per_voxel
pub fn triangle_capacity(chunk_size: u32, resolution_per_voxel: u32) -> u64 {
    voxel_count(chunk_size) * MAX_TRIANGLES_PER_VOXEL * resolution_per_voxel as u64
}

/// Samples per axis of the density and normal volumes
pub fn volume_extent(chunk_size: u32) -> u32 {
    chunk_size + VOLUME_PADDING
}

fn voxel_count(chunk_size: u32) -> u64 {
    let n = chunk_size as u64;
    n * n * n
}

/// Fails when a reported vertex count does not fit the allocated capacity
pub fn check_capacity(reported: u64, capacity: u64) -> TerrainResult<()> {
    if reported > capacity {
        return Err(TerrainError::CapacityExceeded { reported, capacity });
    }
    Ok(())
}

/// Owns the shared geometry buffers and volumes
#[derive(Debug, Default)]
pub struct BufferAllocator {
    generation: u64,
    current: Option<(GeometryBufferSet, VolumeSet)>,
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped by every allocation and every release
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&(GeometryBufferSet, VolumeSet)> {
        self.current.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.current.is_some()
    }

    /// Release the previous set (if any) and allocate a fresh, zeroed one
    pub fn allocate<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        chunk_size: u32,
        resolution_per_voxel: u32,
        max_debug_points: u32,
    ) -> TerrainResult<(GeometryBufferSet, VolumeSet)> {
        if chunk_size == 0 {
            return Err(TerrainError::invalid_config("chunk_size", "must be at least 1"));
        }
        if resolution_per_voxel == 0 {
            return Err(TerrainError::invalid_config(
                "resolution_per_voxel",
                "must be at least 1",
            ));
        }

        self.release(device);

        let vertex_capacity = vertex_capacity(chunk_size, resolution_per_voxel);
        let triangle_capacity = triangle_capacity(chunk_size, resolution_per_voxel);
        let debug_capacity = max_debug_points.max(1) as u64;
        let extent = volume_extent(chunk_size);

        let limits = device.limits();
        let vertex_bytes = vertex_capacity * VERTEX_STRIDE;
        if vertex_bytes > limits.max_buffer_size {
            return Err(TerrainError::ResourceLimit {
                resource: "vertices".to_string(),
                requested: vertex_bytes,
                limit: limits.max_buffer_size,
            });
        }
        if extent > limits.max_texture_dimension_3d {
            return Err(TerrainError::ResourceLimit {
                resource: "volume extent".to_string(),
                requested: extent as u64,
                limit: limits.max_texture_dimension_3d as u64,
            });
        }

        let mut created = PartialSet::default();
        match Self::create_all(
            device,
            &mut created,
            vertex_capacity,
            triangle_capacity,
            debug_capacity,
            extent,
        ) {
            Ok(()) => {}
            Err(e) => {
                log::error!("[BufferAllocator] Allocation failed, releasing partial set: {}", e);
                created.release(device);
                self.generation += 1;
                return Err(e);
            }
        }

        self.generation += 1;
        let (Some(vertices), Some(normals), Some(triangles), Some(counter_readback), Some(debug_points)) = (
            created.vertices,
            created.normals,
            created.triangles,
            created.counter_readback,
            created.debug_points,
        ) else {
            created.release(device);
            return Err(TerrainError::invalid_config("allocation", "incomplete buffer set"));
        };
        let (Some(density), Some(normal_volume)) = (created.density, created.normal_volume) else {
            created.release(device);
            return Err(TerrainError::invalid_config("allocation", "incomplete volume set"));
        };

        let geometry = GeometryBufferSet {
            vertices,
            normals,
            triangles,
            counter_readback,
            debug_points,
            vertex_capacity,
            triangle_capacity,
            debug_capacity,
            generation: self.generation,
        };
        let volumes = VolumeSet {
            density,
            normals: normal_volume,
            extent,
        };

        log::info!(
            "[BufferAllocator] Allocated generation {}: {} vertices ({:.1} MB x2), {} triangles, {}^3 volumes on {}",
            self.generation,
            vertex_capacity,
            vertex_bytes as f64 / (1024.0 * 1024.0),
            triangle_capacity,
            extent,
            device.backend_name()
        );

        self.current = Some((geometry, volumes));
        Ok((geometry, volumes))
    }

    fn create_all<D: ComputeDevice + ?Sized>(
        device: &mut D,
        created: &mut PartialSet,
        vertex_capacity: u64,
        triangle_capacity: u64,
        debug_capacity: u64,
        extent: u32,
    ) -> TerrainResult<()> {
        created.vertices = Some(device.create_buffer(&BufferDescriptor {
            label: "vertices",
            size: vertex_capacity * VERTEX_STRIDE,
            kind: BufferKind::Append {
                unit: CounterUnit::Triangles,
            },
        })?);
        created.normals = Some(device.create_buffer(&BufferDescriptor {
            label: "normals",
            size: vertex_capacity * VERTEX_STRIDE,
            kind: BufferKind::Storage,
        })?);
        created.triangles = Some(device.create_buffer(&BufferDescriptor {
            label: "triangles",
            size: triangle_capacity * TRIANGLE_STRIDE,
            kind: BufferKind::Storage,
        })?);
        created.counter_readback = Some(device.create_buffer(&BufferDescriptor {
            label: "counter readback",
            size: COUNTER_STRIDE,
            kind: BufferKind::Readback,
        })?);
        created.debug_points = Some(device.create_buffer(&BufferDescriptor {
            label: "debug points",
            size: debug_capacity * DEBUG_POINT_STRIDE,
            kind: BufferKind::Append {
                unit: CounterUnit::Vertices,
            },
        })?);
        created.density = Some(device.create_volume(&VolumeDescriptor {
            label: "density volume",
            extent,
            format: VolumeFormat::Scalar,
        })?);
        created.normal_volume = Some(device.create_volume(&VolumeDescriptor {
            label: "normal volume",
            extent,
            format: VolumeFormat::Vector,
        })?);
        Ok(())
    }

    /// Release everything; a no-op when nothing is allocated
    pub fn release<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        if let Some((geometry, volumes)) = self.current.take() {
            for id in [
                geometry.vertices,
                geometry.normals,
                geometry.triangles,
                geometry.counter_readback,
                geometry.debug_points,
            ] {
                device.destroy_buffer(id);
            }
            device.destroy_volume(volumes.density);
            device.destroy_volume(volumes.normals);
            self.generation += 1;
            log::debug!(
                "[BufferAllocator] Released generation {}, now {}",
                geometry.generation,
                self.generation
            );
        }
    }
}

#[derive(Default)]
struct PartialSet {
    vertices: Option<BufferId>,
    normals: Option<BufferId>,
    triangles: Option<BufferId>,
    counter_readback: Option<BufferId>,
    debug_points: Option<BufferId>,
    density: Option<VolumeId>,
    normal_volume: Option<VolumeId>,
}

impl PartialSet {
    fn release<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        for id in [
            self.vertices.take(),
            self.normals.take(),
            self.triangles.take(),
            self.counter_readback.take(),
            self.debug_points.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.destroy_buffer(id);
        }
        for id in [self.density.take(), self.normal_volume.take()].into_iter().flatten() {
            device.destroy_volume(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuDevice;

    #[test]
    fn test_capacity_formulas() {
        assert_eq!(vertex_capacity(8, 1), 7680);
        assert_eq!(triangle_capacity(8, 1), 2560);
        assert_eq!(vertex_capacity(8, 2), 15360);
        assert_eq!(volume_extent(8), 9);
        assert_eq!(volume_extent(63), 64);
    }

    #[test]
    fn test_check_capacity_boundary() {
        let capacity = vertex_capacity(8, 1);
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
    fn test_allocate_sizes_and_generation() {
        let mut device = CpuDevice::new();
        let mut allocator = BufferAllocator::new();
        assert_eq!(allocator.generation(), 0);

        let (geometry, volumes) = allocator.allocate(&mut device, 7, 1, 4).unwrap();
        assert_eq!(geometry.vertex_capacity, 343 * 15);
        assert_eq!(geometry.debug_capacity, 4);
        assert_eq!(volumes.extent, 8);
        assert_eq!(geometry.generation, 1);
        assert_eq!(
            device.buffer_size(geometry.vertices).unwrap(),
            geometry.vertex_capacity * VERTEX_STRIDE
        );
        assert_eq!(device.live_buffer_count(), 5);
        assert_eq!(device.live_volume_count(), 2);

        // Reallocation releases the previous set first
        let (second, _) = allocator.allocate(&mut device, 15, 1, 0).unwrap();
        assert_eq!(second.generation, 3);
        assert_eq!(second.debug_capacity, 1);
        assert_eq!(device.live_buffer_count(), 5);
        assert!(device.buffer_size(geometry.vertices).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut device = CpuDevice::new();
        let mut allocator = BufferAllocator::new();

        allocator.release(&mut device);
        assert_eq!(allocator.generation(), 0);

        allocator.allocate(&mut device, 7, 1, 1).unwrap();
        allocator.release(&mut device);
        let after_first = allocator.generation();
        allocator.release(&mut device);

        assert_eq!(allocator.generation(), after_first);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_volume_count(), 0);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let mut device = CpuDevice::new();
        let mut allocator = BufferAllocator::new();
        assert!(matches!(
            allocator.allocate(&mut device, 0, 1, 1),
            Err(TerrainError::InvalidConfig { .. })
        ));
        assert!(allocator.allocate(&mut device, 8, 0, 1).is_err());
    }

    #[test]
    fn test_out_of_memory_releases_partial_set() {
        let mut device = CpuDevice::new();
        // Enough for the vertex buffer but not for normals
        device.set_memory_budget(Some(343 * 15 * VERTEX_STRIDE + 64));
        let mut allocator = BufferAllocator::new();

        let err = allocator.allocate(&mut device, 7, 1, 1).unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(device.live_buffer_count(), 0);
        assert!(!allocator.is_allocated());
    }
}
