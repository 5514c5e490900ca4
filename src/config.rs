//! Configuration for the identity resolution cache.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (idstitch.toml)
//! ```toml
//! data_dir = "/var/lib/idstitch"
//! ttl_secs = 604800
//! similarity_threshold = 0.75
//!
//! [storage]
//! block_cache_mb = 64
//! write_buffer_mb = 32
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default retention window for bucket records: 7 days.
pub const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Default maintenance sweep interval: 5 minutes.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
/// Default per-call resolve deadline in milliseconds.
pub const DEFAULT_RESOLVE_DEADLINE_MS: u64 = 250;
/// Default cap on records retained per bucket (0 disables the cap).
pub const DEFAULT_MAX_RECORDS_PER_BUCKET: usize = 64;
const DEFAULT_BLOCK_CACHE_MB: usize = 64;
const DEFAULT_WRITE_BUFFER_MB: usize = 32;

/// Main configuration for the identity stitcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Data directory for persistent storage; `None` selects the in-memory
    /// backend.
    pub data_dir: Option<PathBuf>,
    /// Retention window for bucket records, in seconds
    pub ttl_secs: u64,
    /// Maintenance sweep interval, in seconds
    pub sweep_interval_secs: u64,
    /// Aggregate-score cutoff for identity linking
    pub similarity_threshold: f64,
    /// Per-call resolve deadline, in milliseconds
    pub resolve_deadline_ms: u64,
    /// Cap on records retained per bucket (0 = uncapped)
    pub max_records_per_bucket: usize,
    /// RocksDB storage tuning (advanced)
    pub storage: StorageConfig,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            ttl_secs: DEFAULT_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            similarity_threshold: crate::similarity::SIMILARITY_THRESHOLD,
            resolve_deadline_ms: DEFAULT_RESOLVE_DEADLINE_MS,
            max_records_per_bucket: DEFAULT_MAX_RECORDS_PER_BUCKET,
            storage: StorageConfig::default(),
        }
    }
}

impl StitchConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Programmatic overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(StitchConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with IDSTITCH_ prefix; nesting uses
        // a double underscore (IDSTITCH_STORAGE__BLOCK_CACHE_MB) so flat keys
        // like ttl_secs survive unsplit.
        figment = figment.merge(Env::prefixed("IDSTITCH_").split("__"));

        // Layer 3: Programmatic overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Lower the raw config into validated linker tuning.
    pub fn tuning(&self) -> Result<LinkerTuning, ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::new("ttl_secs must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::new("sweep_interval_secs must be positive"));
        }
        if !self.similarity_threshold.is_finite()
            || self.similarity_threshold <= 0.0
            || self.similarity_threshold > 4.0
        {
            return Err(ConfigError::new(
                "similarity_threshold must lie in (0, 4], the aggregate score range",
            ));
        }
        Ok(LinkerTuning {
            ttl: time::Duration::seconds(self.ttl_secs as i64),
            similarity_threshold: self.similarity_threshold,
            max_records_per_bucket: self.max_records_per_bucket,
            resolve_deadline: std::time::Duration::from_millis(self.resolve_deadline_ms),
            sweep_interval: std::time::Duration::from_secs(self.sweep_interval_secs),
        })
    }
}

/// RocksDB storage configuration (advanced).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block cache size in MB
    pub block_cache_mb: usize,
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_cache_mb: DEFAULT_BLOCK_CACHE_MB,
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
        }
    }
}

/// Programmatic overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_deadline_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_records_per_bucket: Option<usize>,
}

/// Validated tuning consumed by the stores and the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkerTuning {
    /// Retention window for bucket records
    pub ttl: time::Duration,
    /// Aggregate-score cutoff for identity linking
    pub similarity_threshold: f64,
    /// Cap on records retained per bucket (0 = uncapped)
    pub max_records_per_bucket: usize,
    /// Upper bound on waiting for a bucket's lock during resolve
    pub resolve_deadline: std::time::Duration,
    /// Maintenance sweep interval
    pub sweep_interval: std::time::Duration,
}

impl Default for LinkerTuning {
    fn default() -> Self {
        StitchConfig::default()
            .tuning()
            .expect("default config is valid")
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StitchConfig::default();
        assert_eq!(config.ttl_secs, DEFAULT_TTL_SECS);
        assert_eq!(config.similarity_threshold, 0.75);
        assert!(config.data_dir.is_none());
        assert_eq!(config.storage.block_cache_mb, DEFAULT_BLOCK_CACHE_MB);
    }

    #[test]
    fn test_default_tuning_is_valid() {
        let tuning = LinkerTuning::default();
        assert_eq!(tuning.ttl, time::Duration::days(7));
        assert_eq!(tuning.max_records_per_bucket, 64);
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "idstitch.toml",
                "ttl_secs = 3600\nsimilarity_threshold = 1.5",
            )?;
            let config =
                StitchConfig::load(Some("idstitch.toml"), ConfigOverrides::default()).unwrap();
            assert_eq!(config.ttl_secs, 3600);
            assert_eq!(config.similarity_threshold, 1.5);
            // Untouched fields keep their defaults
            assert_eq!(config.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
            Ok(())
        });
    }

    #[test]
    fn test_env_layer_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("idstitch.toml", "ttl_secs = 3600")?;
            jail.set_env("IDSTITCH_TTL_SECS", "120");
            let config =
                StitchConfig::load(Some("idstitch.toml"), ConfigOverrides::default()).unwrap();
            assert_eq!(config.ttl_secs, 120);
            Ok(())
        });
    }

    #[test]
    fn test_overrides_win_over_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("idstitch.toml", "ttl_secs = 3600")?;
            let overrides = ConfigOverrides {
                ttl_secs: Some(60),
                ..Default::default()
            };
            let config = StitchConfig::load(Some("idstitch.toml"), overrides).unwrap();
            assert_eq!(config.ttl_secs, 60);
            Ok(())
        });
    }

    #[test]
    fn test_tuning_rejects_bad_threshold() {
        let mut config = StitchConfig {
            similarity_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.tuning().is_err());

        config.similarity_threshold = 5.0;
        assert!(config.tuning().is_err());

        config.similarity_threshold = f64::NAN;
        assert!(config.tuning().is_err());

        config.similarity_threshold = 4.0;
        assert!(config.tuning().is_ok());
    }

    #[test]
    fn test_tuning_rejects_zero_intervals() {
        let config = StitchConfig {
            ttl_secs: 0,
            ..Default::default()
        };
        assert!(config.tuning().is_err());

        let config = StitchConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.tuning().is_err());
    }
}
