//! Application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecastError, RecastResult};

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Export pipeline tuning.
    pub pipeline: PipelineConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Which frame source implementation an export job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodePath {
    /// Decode-ahead when a decoder backend supports the codec, fallback otherwise.
    #[default]
    Auto,
    /// Always use demuxer + decoder service.
    Accelerated,
    /// Always use the prefetching playback-element path.
    Fallback,
}

/// Export pipeline parameters. The thresholds are design defaults, not
/// hard limits; every one of them can be overridden from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum decoder occupancy before producers suspend.
    pub decoder_queue_size: usize,

    /// Worker threads for intra-only codecs. Inter-frame codecs always use one.
    pub decoder_workers: usize,

    /// Capacity of the queue between frame production and the encoder.
    pub encode_queue_capacity: usize,

    /// Seek settle timeout on the fallback path, in milliseconds.
    pub seek_timeout_ms: u64,

    /// Average decode time under which decoding is reported as hardware accelerated.
    pub hardware_decode_threshold_ms: f64,

    /// Frames that must be sampled before the acceleration heuristic applies.
    pub hardware_decode_min_samples: u64,

    /// Prefetch hit rate expected for sequential access.
    pub prefetch_hit_target: f64,

    /// Frame source selection.
    pub decode_path: DecodePath,

    /// Verbose per-chunk decoder logging.
    pub debug: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "recast=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decoder_queue_size: 6,
            decoder_workers: 4,
            encode_queue_capacity: 6,
            seek_timeout_ms: 5_000,
            hardware_decode_threshold_ms: 5.0,
            hardware_decode_min_samples: 10,
            prefetch_hit_target: 0.9,
            decode_path: DecodePath::Auto,
            debug: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl PipelineConfig {
    /// Seek settle timeout as a duration.
    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> RecastResult<()> {
        if self.decoder_queue_size == 0 {
            return Err(RecastError::config("decoder_queue_size must be at least 1"));
        }
        if self.decoder_workers == 0 {
            return Err(RecastError::config("decoder_workers must be at least 1"));
        }
        if self.encode_queue_capacity == 0 {
            return Err(RecastError::config(
                "encode_queue_capacity must be at least 1",
            ));
        }
        if self.seek_timeout_ms == 0 {
            return Err(RecastError::config("seek_timeout_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.prefetch_hit_target) {
            return Err(RecastError::config(format!(
                "prefetch_hit_target must be within [0, 1], got {}",
                self.prefetch_hit_target
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load and validate config from an explicit path.
    pub fn load_from(path: &Path) -> RecastResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("recast").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.decoder_queue_size, 6);
        assert_eq!(config.encode_queue_capacity, 6);
        assert_eq!(config.seek_timeout(), Duration::from_secs(5));
        assert!((config.hardware_decode_threshold_ms - 5.0).abs() < 1e-9);
        assert_eq!(config.decode_path, DecodePath::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{ "pipeline": { "encode_queue_capacity": 12, "decode_path": "fallback" } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pipeline.encode_queue_capacity, 12);
        assert_eq!(config.pipeline.decode_path, DecodePath::Fallback);
        assert_eq!(config.pipeline.decoder_queue_size, 6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = PipelineConfig {
            encode_queue_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RecastError::Config { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("recast_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{ "pipeline": { "seek_timeout_ms": 250 } }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.pipeline.seek_timeout_ms, 250);

        std::fs::write(&path, r#"{ "pipeline": { "decoder_workers": 0 } }"#).unwrap();
        assert!(AppConfig::load_from(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
