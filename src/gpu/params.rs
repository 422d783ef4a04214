//! Named kernel parameters and resource slots
//!
//! All kernels share one uniform block (`params`). The binder keeps the host copy,
//! validates parameter names against the shader contract, and binds every slot a
//! kernel declares.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::config::NoiseParams;
use crate::constants::{params, slots};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{ComputeDevice, GeometryBufferSet, Kernel, VolumeSet};

/// Uniform block layout, mirrored by `struct ChunkParams` in every program (80 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ChunkUniforms {
    /// World-space origin of the chunk; density is sampled relative to it
    pub chunk_position: [f32; 4],
    /// xyz: padded sample extent, w: logical chunk size
    pub chunk_size: [f32; 4],
    /// World-space origin used for debug point output
    pub world_position: [f32; 4],
    pub seed: f32,
    pub lacunarity: f32,
    pub scale: f32,
    pub gain: f32,
    pub frequency: f32,
    pub octaves: i32,
    pub resolution_per_voxel: i32,
    pub _padding: u32,
}

impl Default for ChunkUniforms {
    fn default() -> Self {
        let noise = NoiseParams::default();
        Self {
            chunk_position: [0.0; 4],
            chunk_size: [0.0; 4],
            world_position: [0.0; 4],
            seed: noise.seed,
            lacunarity: noise.lacunarity,
            scale: noise.scale,
            gain: noise.gain,
            frequency: noise.frequency,
            octaves: noise.octaves,
            resolution_per_voxel: 1,
            _padding: 0,
        }
    }
}

impl ChunkUniforms {
    pub fn padded_size(&self) -> u32 {
        self.chunk_size[0] as u32
    }

    pub fn logical_size(&self) -> u32 {
        self.chunk_size[3] as u32
    }

    pub fn chunk_origin(&self) -> Vec3 {
        Vec4::from_array(self.chunk_position).truncate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Vector(Vec4),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Float(_) => "float",
            ParamValue::Int(_) => "int",
            ParamValue::Vector(_) => "vector",
        }
    }
}

#[derive(Debug, Default)]
pub struct ParameterBinder {
    uniforms: ChunkUniforms,
}

impl ParameterBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniforms(&self) -> &ChunkUniforms {
        &self.uniforms
    }

    /// Set one named parameter in the shared uniform block
    pub fn set_param(&mut self, name: &str, value: ParamValue) -> TerrainResult<()> {
        let u = &mut self.uniforms;
        match (name, value) {
            (params::SEED, ParamValue::Float(v)) => u.seed = v,
            (params::LACUNARITY, ParamValue::Float(v)) => u.lacunarity = v,
            (params::SCALE, ParamValue::Float(v)) => u.scale = v,
            (params::GAIN, ParamValue::Float(v)) => u.gain = v,
            (params::FREQUENCY, ParamValue::Float(v)) => u.frequency = v,
            (params::OCTAVES, ParamValue::Int(v)) => u.octaves = v,
            (params::RESOLUTION_PER_VOXEL, ParamValue::Int(v)) => u.resolution_per_voxel = v,
            (params::CHUNK_POSITION, ParamValue::Vector(v)) => u.chunk_position = v.to_array(),
            (params::CHUNK_SIZE, ParamValue::Vector(v)) => u.chunk_size = v.to_array(),
            (params::WORLD_POSITION, ParamValue::Vector(v)) => u.world_position = v.to_array(),
            (
                params::SEED
                | params::LACUNARITY
                | params::SCALE
                | params::GAIN
                | params::FREQUENCY
                | params::OCTAVES
                | params::RESOLUTION_PER_VOXEL
                | params::CHUNK_POSITION
                | params::CHUNK_SIZE
                | params::WORLD_POSITION,
                other,
            ) => {
                return Err(TerrainError::invalid_config(
                    name,
                    format!("parameter does not accept a {} value", other.type_name()),
                ))
            }
            _ => {
                return Err(TerrainError::UnknownParameter {
                    name: name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Bind every parameter and resource slot the given kernels declare
    ///
    /// Must run for every chunk (the world position changes) and after every
    /// reallocation (the resource ids change).
    #[allow(clippy::too_many_arguments)]
    pub fn bind<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        kernels: &[&Kernel],
        buffers: &GeometryBufferSet,
        volumes: &VolumeSet,
        world_position: Vec3,
        chunk_size: u32,
        noise: &NoiseParams,
        resolution_per_voxel: u32,
    ) -> TerrainResult<()> {
        let padded = volumes.extent as f32;
        let position = world_position.extend(1.0);

        self.set_param(params::CHUNK_POSITION, ParamValue::Vector(position))?;
        self.set_param(params::WORLD_POSITION, ParamValue::Vector(position))?;
        self.set_param(
            params::CHUNK_SIZE,
            ParamValue::Vector(Vec4::new(padded, padded, padded, chunk_size as f32)),
        )?;
        self.set_param(params::SEED, ParamValue::Float(noise.seed))?;
        self.set_param(params::LACUNARITY, ParamValue::Float(noise.lacunarity))?;
        self.set_param(params::SCALE, ParamValue::Float(noise.scale))?;
        self.set_param(params::GAIN, ParamValue::Float(noise.gain))?;
        self.set_param(params::FREQUENCY, ParamValue::Float(noise.frequency))?;
        self.set_param(params::OCTAVES, ParamValue::Int(noise.octaves))?;
        self.set_param(
            params::RESOLUTION_PER_VOXEL,
            ParamValue::Int(resolution_per_voxel as i32),
        )?;

        let buffer_slots = [
            (slots::VERTICES, buffers.vertices),
            (slots::NORMALS, buffers.normals),
            (slots::TRIANGLES, buffers.triangles),
            (slots::DEBUG_POINTS, buffers.debug_points),
        ];
        let volume_slots = [
            (slots::NOISE_TEXTURE, volumes.density),
            (slots::NORMAL_TEXTURE, volumes.normals),
        ];

        for kernel in kernels {
            if kernel.declares(params::UNIFORM_BLOCK) {
                device.set_uniforms(kernel.handle, &self.uniforms)?;
            }
            for (slot, buffer) in buffer_slots {
                if kernel.declares(slot) {
                    device.bind_buffer(kernel.handle, slot, buffer)?;
                }
            }
            for (slot, volume) in volume_slots {
                if kernel.declares(slot) {
                    device.bind_volume(kernel.handle, slot, volume)?;
                }
            }
        }

        log::debug!(
            "[ParameterBinder] Bound {} kernels at world position {:?}",
            kernels.len(),
            world_position
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_block_is_80_bytes() {
        assert_eq!(std::mem::size_of::<ChunkUniforms>(), 80);
        assert_eq!(std::mem::size_of::<ChunkUniforms>() % 16, 0);
    }

    #[test]
    fn test_set_param_by_name() {
        let mut binder = ParameterBinder::new();
        binder.set_param("octaves", ParamValue::Int(6)).unwrap();
        binder.set_param("gain", ParamValue::Float(0.5)).unwrap();
        binder
            .set_param("chunkSize", ParamValue::Vector(Vec4::new(16.0, 16.0, 16.0, 15.0)))
            .unwrap();

        let u = binder.uniforms();
        assert_eq!(u.octaves, 6);
        assert_eq!(u.gain, 0.5);
        assert_eq!(u.padded_size(), 16);
        assert_eq!(u.logical_size(), 15);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut binder = ParameterBinder::new();
        let err = binder
            .set_param("persistence", ParamValue::Float(0.5))
            .unwrap_err();
        assert!(matches!(err, TerrainError::UnknownParameter { name } if name == "persistence"));
    }

    #[test]
    fn test_wrong_value_type_rejected() {
        let mut binder = ParameterBinder::new();
        let err = binder.set_param("octaves", ParamValue::Float(3.0)).unwrap_err();
        assert!(matches!(err, TerrainError::InvalidConfig { .. }));
    }
}
