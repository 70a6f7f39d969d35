//! Engine configuration.
//!
//! Every section has sensible defaults, so a JSON file only needs to name
//! the values it changes:
//!
//! ```ignore
//! let config = EngineConfig::from_json_str(r#"{ "memory_cache": { "max_bytes": 8388608 } }"#)?;
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Budget of the in-memory decoded-result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub max_bytes: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * MIB,
        }
    }
}

/// Limits of the reusable pixel-buffer pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Pooled bytes beyond which released buffers are dropped.
    pub max_bytes: u64,
    /// Buffers kept per size class.
    pub max_buffers_per_class: usize,
    /// How many times larger than requested a reused buffer may be.
    pub max_oversize_factor: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 32 * MIB,
            max_buffers_per_class: 8,
            max_oversize_factor: 4,
        }
    }
}

/// Location and budget of the transformed-result disk cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    pub directory: PathBuf,
    #[serde(default = "DiskCacheConfig::default_max_bytes")]
    pub max_bytes: u64,
}

impl DiskCacheConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_bytes: Self::default_max_bytes(),
        }
    }

    fn default_max_bytes() -> u64 {
        256 * MIB
    }
}

/// Tuning of the decode stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Aspect-ratio mismatch above which thumbnail mode decodes a region.
    pub thumbnail_ratio_threshold: f32,
    /// With smaller thumbnails on, a computed sample size equal to this...
    pub smaller_thumbnail_from: u32,
    /// ...is raised to this.
    pub smaller_thumbnail_to: u32,
    /// No decoded edge may exceed this many pixels.
    pub max_texture_edge: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            thumbnail_ratio_threshold: 1.5,
            smaller_thumbnail_from: 2,
            smaller_thumbnail_to: 4,
            max_texture_edge: 4096,
        }
    }
}

/// Size of the decode worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 8);
        Self { threads }
    }
}

/// Top-level configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory_cache: MemoryCacheConfig,
    pub buffer_pool: BufferPoolConfig,
    /// The transformed-result disk cache is off unless a directory is given.
    pub disk_cache: Option<DiskCacheConfig>,
    pub decode: DecodeConfig,
    pub workers: WorkerConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn with_disk_cache(mut self, directory: impl Into<PathBuf>) -> Self {
        self.disk_cache = Some(DiskCacheConfig::new(directory));
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_cache.max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "memory_cache.max_bytes",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.buffer_pool.max_oversize_factor == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_pool.max_oversize_factor",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(disk) = &self.disk_cache {
            if disk.max_bytes == 0 {
                return Err(ConfigError::Invalid {
                    field: "disk_cache.max_bytes",
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        if self.decode.thumbnail_ratio_threshold <= 1.0 {
            return Err(ConfigError::Invalid {
                field: "decode.thumbnail_ratio_threshold",
                reason: format!("{} is not above 1.0", self.decode.thumbnail_ratio_threshold),
            });
        }
        if self.decode.max_texture_edge == 0 {
            return Err(ConfigError::Invalid {
                field: "decode.max_texture_edge",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.workers.threads == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.threads",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.disk_cache.is_none());
        assert_eq!(config.decode.thumbnail_ratio_threshold, 1.5);
        assert!((2..=8).contains(&config.workers.threads));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "memory_cache": { "max_bytes": 1024 }, "disk_cache": { "directory": "/tmp/lumen" } }"#,
        )
        .unwrap();
        assert_eq!(config.memory_cache.max_bytes, 1024);
        assert_eq!(config.buffer_pool, BufferPoolConfig::default());
        let disk = config.disk_cache.unwrap();
        assert_eq!(disk.directory, PathBuf::from("/tmp/lumen"));
        assert_eq!(disk.max_bytes, 256 * MIB);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let result = EngineConfig::from_json_str(
            r#"{ "decode": { "thumbnail_ratio_threshold": 0.5 } }"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "decode.thumbnail_ratio_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.workers.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load("/nonexistent/lumen.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
