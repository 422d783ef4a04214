//! Compute stages of one chunk generation pass
//!
//! Density and normal stages run over the padded volume and must tile it exactly.
//! The isosurface and copy stages round up and rely on the kernels' bounds checks.

use crate::config::ChunkConfig;
use crate::constants::kernels;
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{ComputeDevice, ComputeProgram, DeviceLimits, Kernel, KernelBinder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    DensityField,
    NormalEstimation,
    IsoSurface,
    CopyMesh,
}

impl StageKind {
    pub fn kernel_name(self) -> &'static str {
        match self {
            StageKind::DensityField => kernels::NOISE_3D,
            StageKind::NormalEstimation => kernels::NORMAL_ESTIMATE,
            StageKind::IsoSurface => kernels::ISOSURFACE_EXTRACT,
            StageKind::CopyMesh => kernels::COPY_MESH_BUFFERS,
        }
    }
}

/// Workgroups for a volume stage; the extent must be a multiple of the group size
pub fn volume_groups(kernel: &str, extent: u32, group_size: [u32; 3]) -> TerrainResult<[u32; 3]> {
    let mut groups = [0u32; 3];
    for (axis, size) in group_size.iter().enumerate() {
        if extent % size != 0 {
            return Err(TerrainError::NonIntegralDispatch {
                kernel: kernel.to_string(),
                extent,
                group_size: *size,
            });
        }
        groups[axis] = extent / size;
    }
    Ok(groups)
}

/// Workgroups covering `extent` cells per axis, rounded up
pub fn cell_groups(extent: u32, group_size: [u32; 3]) -> [u32; 3] {
    group_size.map(|size| extent.div_ceil(size))
}

/// One-dimensional workgroups covering `count` items, rounded up
pub fn linear_groups(kernel: &str, count: u64, group_size: [u32; 3]) -> TerrainResult<[u32; 3]> {
    let groups = count.div_ceil(group_size[0] as u64);
    let groups = u32::try_from(groups).map_err(|_| TerrainError::InvalidDispatch {
        kernel: kernel.to_string(),
        reason: format!("{} items need more than u32::MAX workgroups", count),
    })?;
    Ok([groups, 1, 1])
}

pub fn check_limits(kernel: &str, groups: [u32; 3], limits: &DeviceLimits) -> TerrainResult<()> {
    if groups.iter().any(|g| *g > limits.max_workgroups_per_dimension) {
        return Err(TerrainError::InvalidDispatch {
            kernel: kernel.to_string(),
            reason: format!(
                "workgroup count {:?} exceeds device limit {}",
                groups, limits.max_workgroups_per_dimension
            ),
        });
    }
    Ok(())
}

/// A resolved kernel plus the workgroup count computed for the current config
#[derive(Debug, Clone)]
pub struct ComputeStage {
    kind: StageKind,
    kernel: Kernel,
    groups: Option<[u32; 3]>,
}

impl ComputeStage {
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        program: &ComputeProgram,
        kind: StageKind,
    ) -> TerrainResult<Self> {
        let kernel = KernelBinder::resolve(device, program, kind.kernel_name())?;
        Ok(Self {
            kind,
            kernel,
            groups: None,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn groups(&self) -> Option<[u32; 3]> {
        self.groups
    }

    /// Workgroup count for a config, without changing the stage
    pub fn plan(
        &self,
        config: &ChunkConfig,
        triangle_capacity: u64,
        limits: &DeviceLimits,
    ) -> TerrainResult<[u32; 3]> {
        let name = self.kernel.name.as_str();
        let group_size = self.kernel.group_size;
        let groups = match self.kind {
            StageKind::DensityField | StageKind::NormalEstimation => {
                volume_groups(name, config.padded_size(), group_size)?
            }
            StageKind::IsoSurface => {
                cell_groups(config.padded_size() * config.resolution_per_voxel, group_size)
            }
            StageKind::CopyMesh => linear_groups(name, triangle_capacity, group_size)?,
        };
        check_limits(name, groups, limits)?;
        Ok(groups)
    }

    pub fn set_groups(&mut self, groups: [u32; 3]) {
        self.groups = Some(groups);
    }

    pub fn dispatch<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> TerrainResult<()> {
        let groups = self.groups.ok_or(TerrainError::NotConfigured)?;
        device.dispatch(self.kernel.handle, groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_groups_exact() {
        assert_eq!(volume_groups("noise3D", 64, [8, 8, 8]).unwrap(), [8, 8, 8]);
        assert!(matches!(
            volume_groups("noise3D", 9, [8, 8, 8]),
            Err(TerrainError::NonIntegralDispatch {
                extent: 9,
                group_size: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_cell_and_linear_groups_round_up() {
        assert_eq!(cell_groups(9, [8, 8, 8]), [2, 2, 2]);
        assert_eq!(cell_groups(16, [8, 4, 1]), [2, 4, 16]);
        assert_eq!(linear_groups("copyMeshBuffers", 2560, [64, 1, 1]).unwrap(), [40, 1, 1]);
        assert_eq!(linear_groups("copyMeshBuffers", 65, [64, 1, 1]).unwrap(), [2, 1, 1]);
    }

    #[test]
    fn test_group_limit() {
        let limits = DeviceLimits {
            max_buffer_size: 1 << 20,
            max_workgroups_per_dimension: 4,
            max_texture_dimension_3d: 256,
        };
        assert!(check_limits("noise3D", [4, 4, 4], &limits).is_ok());
        assert!(matches!(
            check_limits("noise3D", [5, 1, 1], &limits),
            Err(TerrainError::InvalidDispatch { .. })
        ));
    }
}
