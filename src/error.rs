//! Error handling for the terrain pipeline
//!
//! Configuration errors are fatal for pipeline construction, resource errors are fatal
//! for the current pass, capacity and stale-generation errors are reported and recovered.

use std::path::PathBuf;

/// Result alias used across the crate
pub type TerrainResult<T> = Result<T, TerrainError>;

#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Kernel '{kernel}' not found in program '{program}'")]
    KernelNotFound { program: String, kernel: String },

    #[error("Failed to parse compute program '{program}' at line {line}: {reason}")]
    ShaderParse {
        program: String,
        line: usize,
        reason: String,
    },

    #[error("Kernel '{kernel}' failed to compile: {error}")]
    KernelCompilation { kernel: String, error: String },

    #[error("Extent {extent} is not divisible by group size {group_size} for kernel '{kernel}'")]
    NonIntegralDispatch {
        kernel: String,
        extent: u32,
        group_size: u32,
    },

    #[error("Invalid dispatch for kernel '{kernel}': {reason}")]
    InvalidDispatch { kernel: String, reason: String },

    #[error("Kernel '{kernel}' declares no slot named '{slot}'")]
    UnknownSlot { kernel: String, slot: String },

    #[error("Unknown kernel parameter '{name}'")]
    UnknownParameter { name: String },

    #[error("Slot '{slot}' of kernel '{kernel}' has nothing bound")]
    UnboundSlot { kernel: String, slot: String },

    #[error("Chunk size {requested} does not match configured chunk size {configured}")]
    ConfigMismatch { configured: u32, requested: u32 },

    #[error("Pipeline has no configuration; call configure() first")]
    NotConfigured,

    #[error("Device out of memory while allocating '{resource}' ({bytes} bytes)")]
    OutOfMemory { resource: String, bytes: u64 },

    #[error("Resource '{resource}' exceeds device limit: {requested} > {limit}")]
    ResourceLimit {
        resource: String,
        requested: u64,
        limit: u64,
    },

    #[error("Isosurface output of {reported} vertices exceeds buffer capacity {capacity}")]
    CapacityExceeded { reported: u64, capacity: u64 },

    #[error("Readback from generation {request} consumed after buffers moved to generation {live}")]
    StaleGeneration { request: u64, live: u64 },

    #[error("GPU transfer failed: {reason}")]
    TransferFailed { reason: String },

    #[error("No compute device available: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("Unknown {kind} handle {id}")]
    UnknownResource { kind: &'static str, id: u32 },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl TerrainError {
    /// Configuration errors abort pipeline construction and are never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TerrainError::InvalidConfig { .. }
                | TerrainError::KernelNotFound { .. }
                | TerrainError::ShaderParse { .. }
                | TerrainError::KernelCompilation { .. }
                | TerrainError::NonIntegralDispatch { .. }
                | TerrainError::InvalidDispatch { .. }
                | TerrainError::UnknownSlot { .. }
                | TerrainError::UnknownParameter { .. }
                | TerrainError::UnboundSlot { .. }
                | TerrainError::ConfigMismatch { .. }
                | TerrainError::NotConfigured
                | TerrainError::ConfigParse(_)
        )
    }

    /// Resource exhaustion; the caller may retry with a smaller chunk size
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            TerrainError::OutOfMemory { .. } | TerrainError::ResourceLimit { .. }
        )
    }

    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        TerrainError::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Helper trait for attaching context to foreign errors
pub trait ErrorContext<T> {
    fn transfer_context(self, context: &str) -> TerrainResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn transfer_context(self, context: &str) -> TerrainResult<T> {
        self.map_err(|e| TerrainError::TransferFailed {
            reason: format!("{}: {}", context, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = TerrainError::KernelNotFound {
            program: "isosurface".to_string(),
            kernel: "isosurfaceExtract".to_string(),
        };
        assert!(missing.is_configuration());
        assert!(!missing.is_resource_exhaustion());

        let oom = TerrainError::OutOfMemory {
            resource: "vertices".to_string(),
            bytes: 1 << 30,
        };
        assert!(oom.is_resource_exhaustion());
        assert!(!oom.is_configuration());
    }

    #[test]
    fn test_transfer_context() {
        let result: Result<(), &str> = Err("channel closed");
        let err = result.transfer_context("vertices readback").unwrap_err();
        assert!(err.to_string().contains("vertices readback: channel closed"));
    }
}
