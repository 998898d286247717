//! Worker configuration: TOML file plus environment overrides.
//!
//! Every tunable the pipeline consumes is declared here with its default;
//! a missing config file yields a fully defaulted configuration suitable
//! for the embedded single-node deployment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Broker consumption and dead-lettering knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// In-flight cap per consumer; a crashing consumer loses at most this
    /// many unacknowledged deliveries to redelivery.
    pub prefetch_count: u16,
    /// Deliveries before a message is routed to the dead-letter queue.
    pub max_delivery_attempts: u32,
    /// Per-queue message TTL before dead-lettering. Long enough to survive
    /// an operator restart.
    pub dlq_ttl_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            max_delivery_attempts: 3,
            dlq_ttl_seconds: 24 * 60 * 60,
        }
    }
}

/// Batched-consumer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingConfig {
    /// Cap of messages per collection batch before it is processed
    /// immediately.
    pub max_batch_size: usize,
    /// Max age of an unflushed batch before the periodic flusher picks it up.
    pub batch_timeout_seconds: u64,
    /// Bound on the shutdown drain of remaining batches.
    pub shutdown_drain_seconds: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_timeout_seconds: 5,
            shutdown_drain_seconds: 30,
        }
    }
}

/// OOM guards applied before a source is read in full.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Cap for members extracted out of archives.
    pub max_zip_entry_size_bytes: u64,
    /// Cap for regular files read off the filesystem.
    pub max_image_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_zip_entry_size_bytes: 20 * 1024 * 1024 * 1024,
            max_image_size_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThumbnailConfig {
    pub width: u32,
    pub height: u32,
    /// jpeg | png | webp | original
    pub format: String,
    pub quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: 300,
            height: 300,
            format: "jpeg".to_string(),
            quality: 85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub quality: u8,
    /// Copy the source through instead of re-encoding.
    pub preserve_original: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: "jpeg".to_string(),
            quality: 85,
            preserve_original: false,
        }
    }
}

/// One cache root directory available for artifact placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheRootConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Persistence backend selection.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// PostgreSQL connection URL; in-memory store when absent.
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
}

/// External tool paths; looked up on `PATH` when relative.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub ffprobe_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub sevenzip_path: PathBuf,
    pub unrar_path: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: PathBuf::from("ffprobe"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            sevenzip_path: PathBuf::from("7z"),
            unrar_path: PathBuf::from("unrar"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub batching: BatchingConfig,
    pub limits: LimitsConfig,
    pub thumbnail: ThumbnailConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub tools: ToolsConfig,
    pub cache_roots: Vec<CacheRootConfig>,
}

impl WorkerConfig {
    /// Load from an explicit path, or from `IMAGEVIEWER_CONFIG`, or fall
    /// back to defaults when neither names an existing file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("IMAGEVIEWER_CONFIG").map(PathBuf::from));

        let mut config = match resolved {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path,
                    source: Box::new(source),
                })?
            }
            None => Self::default(),
        };

        if let Ok(url) = std::env::var("IMAGEVIEWER_DATABASE_URL") {
            if !url.is_empty() {
                config.store.database_url = Some(url);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batching.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be positive".into()));
        }
        if self.broker.prefetch_count == 0 {
            return Err(ConfigError::Invalid("prefetch_count must be positive".into()));
        }
        if self.broker.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_delivery_attempts must be positive".into(),
            ));
        }
        if self.limits.max_image_size_bytes == 0 || self.limits.max_zip_entry_size_bytes == 0 {
            return Err(ConfigError::Invalid("size limits must be positive".into()));
        }
        for quality in [self.thumbnail.quality, self.cache.quality] {
            if quality == 0 || quality > 100 {
                return Err(ConfigError::Invalid(format!(
                    "quality must be in 1..=100, got {quality}"
                )));
            }
        }
        for format in [&self.thumbnail.format, &self.cache.format] {
            match format.as_str() {
                "jpeg" | "png" | "webp" | "original" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported artifact format: {other}"
                    )));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for root in &self.cache_roots {
            if !seen.insert(&root.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cache root name: {}",
                    root.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.batching.max_batch_size, 50);
        assert_eq!(config.batching.batch_timeout_seconds, 5);
        assert_eq!(config.broker.prefetch_count, 10);
    }

    #[test]
    fn parses_partial_file_and_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [batching]
            max_batch_size = 10

            [[cache_roots]]
            name = "primary"
            path = "/var/cache/imageviewer"
            "#
        )
        .unwrap();

        let config = WorkerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.batching.max_batch_size, 10);
        assert_eq!(config.batching.batch_timeout_seconds, 5);
        assert_eq!(config.cache_roots.len(), 1);
        assert!(config.cache_roots[0].active);
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let mut config = WorkerConfig::default();
        config.cache.quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[batching]\nmax_batchsize = 10\n").unwrap();
        assert!(WorkerConfig::load(Some(file.path())).is_err());
    }
}
