//! Chunk generation configuration
//!
//! Loaded once per streaming pass (TOML or code). Sizing fields decide buffer
//! allocation; any change to them invalidates every allocated GPU resource.

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::constants::chunk::*;
use crate::error::{TerrainError, TerrainResult};

/// Fractal noise parameters forwarded verbatim to the density kernel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    pub seed: f32,
    pub scale: f32,
    pub lacunarity: f32,
    pub octaves: i32,
    pub gain: f32,
    pub frequency: f32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            seed: 0.0,
            scale: 1.0,
            lacunarity: 2.0,
            octaves: 3,
            gain: 1.0,
            frequency: 1.0,
        }
    }
}

/// Which chunk renderer the controller is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// GPU-resident geometry drawn with indirect arguments
    Indirect,
    /// Async transfer to host memory, then host mesh assembly
    Readback,
}

/// How the streaming controller retrieves the append counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    /// Stall until the device finished the chunk (tooling flows)
    Blocking,
    /// Poll an async transfer once per step
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Voxels per axis, excluding the +1 padding
    pub chunk_size: u32,
    /// Marching cubes subdivision factor
    pub resolution_per_voxel: u32,
    /// Chunks generated on each side of the center along x and z
    pub load_radius: u32,
    pub noise: NoiseParams,
    /// World-space offset added to every chunk position
    pub center_offset: Vec3,
    pub max_debug_points: u32,
    pub renderer: RendererKind,
    pub count_mode: CountMode,
    /// Run the optional copyMeshBuffers stage after extraction
    pub copy_mesh_buffers: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            resolution_per_voxel: DEFAULT_RESOLUTION_PER_VOXEL,
            load_radius: DEFAULT_LOAD_RADIUS,
            noise: NoiseParams::default(),
            center_offset: Vec3::ZERO,
            max_debug_points: DEFAULT_MAX_DEBUG_POINTS,
            renderer: RendererKind::Readback,
            count_mode: CountMode::Blocking,
            copy_mesh_buffers: false,
        }
    }
}

/// The subset of the config that determines buffer and texture sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingKey {
    pub chunk_size: u32,
    pub resolution_per_voxel: u32,
    pub max_debug_points: u32,
}

impl ChunkConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> TerrainResult<Self> {
        let config: ChunkConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> TerrainResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TerrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("[ChunkConfig] Loading configuration from {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> TerrainResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TerrainError::invalid_config(
                "chunk_size",
                format!("must be in 1..={}, got {}", MAX_CHUNK_SIZE, self.chunk_size),
            ));
        }
        if self.resolution_per_voxel == 0 || self.resolution_per_voxel > MAX_RESOLUTION_PER_VOXEL {
            return Err(TerrainError::invalid_config(
                "resolution_per_voxel",
                format!(
                    "must be in 1..={}, got {}",
                    MAX_RESOLUTION_PER_VOXEL, self.resolution_per_voxel
                ),
            ));
        }
        if self.load_radius > MAX_LOAD_RADIUS {
            return Err(TerrainError::invalid_config(
                "load_radius",
                format!("must be at most {}, got {}", MAX_LOAD_RADIUS, self.load_radius),
            ));
        }
        if self.noise.octaves < 1 || self.noise.octaves > MAX_OCTAVES {
            return Err(TerrainError::invalid_config(
                "noise.octaves",
                format!("must be in 1..={}, got {}", MAX_OCTAVES, self.noise.octaves),
            ));
        }
        if !(self.noise.scale.is_finite() && self.noise.scale > 0.0) {
            return Err(TerrainError::invalid_config(
                "noise.scale",
                "must be a positive finite number",
            ));
        }
        let finite = [
            ("noise.seed", self.noise.seed),
            ("noise.lacunarity", self.noise.lacunarity),
            ("noise.gain", self.noise.gain),
            ("noise.frequency", self.noise.frequency),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(TerrainError::invalid_config(field, "must be finite"));
            }
        }
        if !self.center_offset.is_finite() {
            return Err(TerrainError::invalid_config("center_offset", "must be finite"));
        }
        Ok(())
    }

    /// Samples per axis of the density and normal volumes
    pub fn padded_size(&self) -> u32 {
        self.chunk_size + VOLUME_PADDING
    }

    pub fn sizing_key(&self) -> SizingKey {
        SizingKey {
            chunk_size: self.chunk_size,
            resolution_per_voxel: self.resolution_per_voxel,
            max_debug_points: self.max_debug_points,
        }
    }

    /// Number of chunks a streaming pass visits
    pub fn chunks_per_pass(&self) -> usize {
        let side = (self.load_radius as usize).saturating_mul(2).saturating_add(1);
        side.saturating_mul(side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChunkConfig::default();
        assert_eq!(config.chunk_size, 63);
        assert_eq!(config.padded_size(), 64);
        assert_eq!(config.load_radius, 1);
        assert_eq!(config.noise.octaves, 3);
        assert_eq!(config.noise.lacunarity, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ChunkConfig::from_toml_str(
            r#"
            chunk_size = 15
            load_radius = 2
            renderer = "indirect"
            count_mode = "deferred"
            center_offset = [0.0, -8.0, 0.0]

            [noise]
            seed = 42.0
            octaves = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk_size, 15);
        assert_eq!(config.load_radius, 2);
        assert_eq!(config.renderer, RendererKind::Indirect);
        assert_eq!(config.count_mode, CountMode::Deferred);
        assert_eq!(config.center_offset, Vec3::new(0.0, -8.0, 0.0));
        assert_eq!(config.noise.seed, 42.0);
        assert_eq!(config.noise.octaves, 5);
        // untouched fields keep their defaults
        assert_eq!(config.noise.gain, 1.0);
        assert_eq!(config.chunks_per_pass(), 25);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ChunkConfig::default();
        config.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(TerrainError::InvalidConfig { .. })
        ));

        let mut config = ChunkConfig::default();
        config.resolution_per_voxel = 0;
        assert!(config.validate().is_err());

        let mut config = ChunkConfig::default();
        config.noise.octaves = 0;
        assert!(config.validate().is_err());

        let mut config = ChunkConfig::default();
        config.noise.frequency = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_radius_upper_bound() {
        let mut config = ChunkConfig::default();
        config.load_radius = MAX_LOAD_RADIUS;
        assert!(config.validate().is_ok());

        config.load_radius = 40_000;
        assert!(matches!(
            config.validate(),
            Err(TerrainError::InvalidConfig { ref field, .. }) if field == "load_radius"
        ));
        config.load_radius = u32::MAX;
        assert!(config.chunks_per_pass() > 0);

        let err = ChunkConfig::from_toml_str("load_radius = 40000\n").unwrap_err();
        assert!(matches!(err, TerrainError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrain.toml");
        std::fs::write(&path, "chunk_size = 7\nresolution_per_voxel = 2\n").unwrap();

        let config = ChunkConfig::load(&path).unwrap();
        assert_eq!(config.chunk_size, 7);
        assert_eq!(config.resolution_per_voxel, 2);

        let missing = ChunkConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(TerrainError::Io { .. })));
    }

    #[test]
    fn test_sizing_key_ignores_noise() {
        let a = ChunkConfig::default();
        let mut b = a.clone();
        b.noise.seed = 99.0;
        b.load_radius = 4;
        assert_eq!(a.sizing_key(), b.sizing_key());

        b.chunk_size = 31;
        assert_ne!(a.sizing_key(), b.sizing_key());
    }
}
