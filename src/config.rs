//! Core configuration
//!
//! Every section has defaults matching a production deployment, so an empty JSON
//! object is a valid configuration.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{BossError, Result};
use crate::layout::CubeSize;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cuboid geometry and codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CuboidConfig {
    pub cube_size: CubeSize,
    pub compression: CompressionMethod,
    pub compression_level: u8,
    /// Uncompressed bytes per codec block
    pub block_size: usize,
}

impl Default for CuboidConfig {
    fn default() -> Self {
        Self {
            cube_size: CubeSize::default(),
            compression: CompressionMethod::Zstd,
            compression_level: CompressionLevel::default().value(),
            block_size: 256 * 1024,
        }
    }
}

/// Tier-1 cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum clean cuboid entries before LRU eviction
    pub max_entries: usize,
    /// Time-to-live of clean entries
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            ttl_secs: 1_209_600,
        }
    }
}

/// Tier-2 blob store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Attempts after the initial read
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            read_timeout_ms: 10_000,
        }
    }
}

/// Flush engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub workers: usize,
    /// Failed attempts on one key before it is escalated to operators
    pub poison_threshold: u32,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poison_threshold: 5,
            visibility_timeout_secs: 120,
            poll_interval_ms: 50,
        }
    }
}

/// Cutout path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoutConfig {
    /// Largest accepted request, uncompressed
    pub max_uncompressed_bytes: u64,
    /// Cuboids fetched concurrently per request
    pub concurrency: usize,
    pub read_deadline_ms: u64,
}

impl Default for CutoutConfig {
    fn default() -> Self {
        Self {
            max_uncompressed_bytes: 1 << 30,
            concurrency: 16,
            read_deadline_ms: 60_000,
        }
    }
}

/// Annotation index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Serialized size after which a new ID index chunk is opened
    pub id_index_new_chunk_threshold: usize,
    pub index_retries: u32,
    pub index_retry_delay_ms: u64,
    /// Dead-letter messages handled per sweep
    pub sweep_batch: usize,
    pub sweep_interval_ms: u64,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            id_index_new_chunk_threshold: 100 * 1024,
            index_retries: 3,
            index_retry_delay_ms: 20,
            sweep_batch: 10,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Ingest pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub wait_for_queues_secs: u64,
    /// Largest ingest, in voxels, allowed outside the large-ingest group
    pub ingest_max_size: u64,
    pub tile_z_chunk_size: u64,
    pub volumetric_z_chunk_size: u64,
    pub large_ingest_group: String,
    pub queue_visibility_secs: u64,
    /// Run tile-index, ingest and completion workers in the background
    pub attach_workers: bool,
    pub poll_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            wait_for_queues_secs: 180,
            ingest_max_size: 1024 * 1024 * 1024 * 1024,
            tile_z_chunk_size: 16,
            volumetric_z_chunk_size: 64,
            large_ingest_group: "bossingest-large".to_string(),
            queue_visibility_secs: 120,
            attach_workers: true,
            poll_interval_ms: 100,
        }
    }
}

/// Downsample pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsampleConfig {
    /// Largest base-resolution voxel count a non-admin may downsample
    pub downsample_max_size: u64,
    /// Concurrent worker tasks per stage
    pub fan_out: usize,
    pub queue_visibility_secs: u64,
    /// Launch a coordinator when a job is queued
    pub launch_coordinator: bool,
    pub poll_interval_ms: u64,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            downsample_max_size: 10 * 1024 * 1024 * 1024 * 1024,
            fan_out: 8,
            queue_visibility_secs: 300,
            launch_coordinator: true,
            poll_interval_ms: 200,
        }
    }
}

/// Throttle defaults used when a metric has no default of its own
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub user_default_limit: i64,
    pub api_default_limit: i64,
    pub system_default_limit: i64,
    pub host: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            user_default_limit: 100 * 1024 * 1024,
            api_default_limit: 1024 * 1024 * 1024,
            system_default_limit: 10 * 1024 * 1024 * 1024,
            host: "localhost".to_string(),
        }
    }
}

/// Complete configuration of the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cuboid: CuboidConfig,
    pub cache: CacheConfig,
    pub blob: BlobConfig,
    pub flush: FlushConfig,
    pub cutout: CutoutConfig,
    pub annotation: AnnotationConfig,
    pub ingest: IngestConfig,
    pub downsample: DownsampleConfig,
    pub throttle: ThrottleConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let cube = &self.cuboid.cube_size;
        if cube.x == 0 || cube.y == 0 || cube.z == 0 {
            return Err(BossError::validation("Cube dimensions must be positive"));
        }
        if self.cuboid.block_size == 0 {
            return Err(BossError::validation("Codec block size must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(BossError::validation("Cache capacity must be positive"));
        }
        if self.flush.workers == 0 || self.cutout.concurrency == 0 || self.downsample.fan_out == 0
        {
            return Err(BossError::validation(
                "Worker and concurrency counts must be positive",
            ));
        }
        if self.ingest.tile_z_chunk_size == 0 || self.ingest.volumetric_z_chunk_size == 0 {
            return Err(BossError::validation("Ingest z chunk sizes must be positive"));
        }
        Ok(())
    }

    pub fn compression_level(&self) -> CompressionLevel {
        CompressionLevel::new(self.cuboid.compression_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config.cuboid.cube_size, CubeSize::new(512, 512, 16));
        assert_eq!(config.ingest.wait_for_queues_secs, 180);
        assert_eq!(config.cutout.max_uncompressed_bytes, 1 << 30);
    }

    #[test]
    fn test_partial_override() {
        let config = CoreConfig::from_json_str(
            r#"{"cuboid": {"cube_size": {"x": 64, "y": 64, "z": 8}}, "flush": {"workers": 1}}"#,
        )
        .unwrap();
        assert_eq!(config.cuboid.cube_size, CubeSize::new(64, 64, 8));
        assert_eq!(config.flush.workers, 1);
        assert_eq!(config.flush.poison_threshold, 5);
    }

    #[test]
    fn test_zero_cube_rejected() {
        let err = CoreConfig::from_json_str(r#"{"cuboid": {"cube_size": {"x": 0, "y": 64, "z": 8}}}"#)
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(&path, r#"{"ingest": {"wait_for_queues_secs": 5}}"#).unwrap();
        let config = CoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.ingest.wait_for_queues_secs, 5);
    }
}
