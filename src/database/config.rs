//! Warehouse configuration file support
//!
//! Handles parsing of `warehouse.toml` configuration files and
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::broker::{BackoffPolicy, BrokerConfig, Jitter};
use super::duckdb::StoreOptions;
use super::{DatabaseError, DatabaseResult};

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "warehouse.toml";

/// Default store path, relative to the working directory
pub const DEFAULT_STORE_PATH: &str = "db/avaliacao_prod.duckdb";

/// Default manifest path, relative to the working directory
pub const DEFAULT_MANIFEST_PATH: &str = "etl_metadata.json";

/// Environment variable for the store path
pub const ENV_DB_PATH: &str = "WAREHOUSE_DB_PATH";

/// Environment variable for the store memory limit
pub const ENV_MEMORY_LIMIT: &str = "WAREHOUSE_MEMORY_LIMIT";

/// Environment variable for the source directory
pub const ENV_SOURCE_DIR: &str = "WAREHOUSE_SOURCE_DIR";

/// Environment variable for the manifest path
pub const ENV_MANIFEST_PATH: &str = "WAREHOUSE_MANIFEST_PATH";

/// Environment variable for the broker concurrency limit
pub const ENV_MAX_CONNECTIONS: &str = "WAREHOUSE_MAX_CONNECTIONS";

/// Store configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Path to the DuckDB store file
    #[serde(default = "default_store_path")]
    pub path: String,

    /// DuckDB memory limit, e.g. "4GB"
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// DuckDB worker threads
    #[serde(default)]
    pub threads: Option<u32>,
}

fn default_store_path() -> String {
    DEFAULT_STORE_PATH.to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            memory_limit: None,
            threads: None,
        }
    }
}

/// Source file configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    /// Directory holding the tabular extracts
    #[serde(default = "default_source_dir")]
    pub dir: String,

    /// Glob pattern, relative to `dir`
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_source_dir() -> String {
    "data/raw".to_string()
}

fn default_pattern() -> String {
    "*.csv".to_string()
}

fn default_delimiter() -> char {
    ','
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            dir: default_source_dir(),
            pattern: default_pattern(),
            delimiter: default_delimiter(),
        }
    }
}

/// Manifest configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSection {
    /// Path of the processing manifest
    #[serde(default = "default_manifest_path")]
    pub path: String,
}

fn default_manifest_path() -> String {
    DEFAULT_MANIFEST_PATH.to_string()
}

impl Default for ManifestSection {
    fn default() -> Self {
        Self {
            path: default_manifest_path(),
        }
    }
}

/// Raw load configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSection {
    /// Rows buffered in the appender before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    50_000
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Star schema rebuild configuration section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RebuildSection {
    /// Institutions aggregated per fact partition; 0 aggregates in one query
    #[serde(default)]
    pub partition_size: usize,
}

/// Connection broker configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Maximum concurrently held handles (readers and writer combined)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-attempt acquisition timeout
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the uniform jitter added to each delay
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_connections() -> usize {
    3
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    1_000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// Main configuration structure
///
/// Represents the `warehouse.toml` configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub source: SourceSection,

    #[serde(default)]
    pub manifest: ManifestSection,

    #[serde(default)]
    pub load: LoadSection,

    #[serde(default)]
    pub rebuild: RebuildSection,

    #[serde(default)]
    pub broker: BrokerSection,
}

impl WarehouseConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a working directory
    ///
    /// Looks for `warehouse.toml` in the directory and falls back to
    /// defaults if it is absent. Environment overrides are applied last.
    pub fn load(working_dir: &Path) -> DatabaseResult<Self> {
        Self::load_from(&working_dir.join(CONFIG_FILENAME))
    }

    /// Load configuration from an explicit file path
    pub fn load_from(config_path: &Path) -> DatabaseResult<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .map_err(|e| DatabaseError::IoError(format!("Failed to read config: {}", e)))?;

            Self::parse(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> DatabaseResult<Self> {
        toml::from_str(content)
            .map_err(|e| DatabaseError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> DatabaseResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DatabaseError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            self.store.path = path;
        }

        if let Ok(limit) = std::env::var(ENV_MEMORY_LIMIT) {
            self.store.memory_limit = Some(limit);
        }

        if let Ok(dir) = std::env::var(ENV_SOURCE_DIR) {
            self.source.dir = dir;
        }

        if let Ok(path) = std::env::var(ENV_MANIFEST_PATH) {
            self.manifest.path = path;
        }

        if let Ok(max) = std::env::var(ENV_MAX_CONNECTIONS)
            && let Ok(max) = max.parse()
        {
            self.broker.max_connections = max;
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> DatabaseResult<()> {
        if self.broker.max_connections == 0 {
            return Err(DatabaseError::ConfigError(
                "broker.max_connections must be at least 1".to_string(),
            ));
        }
        if self.load.batch_size == 0 {
            return Err(DatabaseError::ConfigError(
                "load.batch_size must be at least 1".to_string(),
            ));
        }
        if !self.source.delimiter.is_ascii() {
            return Err(DatabaseError::ConfigError(format!(
                "source.delimiter must be a single ASCII character, got {:?}",
                self.source.delimiter
            )));
        }
        if self.broker.multiplier < 1.0 {
            return Err(DatabaseError::ConfigError(
                "broker.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Store path as a `PathBuf`
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store.path)
    }

    /// Source directory as a `PathBuf`
    pub fn source_dir(&self) -> PathBuf {
        PathBuf::from(&self.source.dir)
    }

    /// Manifest path as a `PathBuf`
    pub fn manifest_path(&self) -> PathBuf {
        PathBuf::from(&self.manifest.path)
    }

    /// DuckDB open options derived from the store section
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            memory_limit: self.store.memory_limit.clone(),
            threads: self.store.threads,
            read_only: false,
        }
    }

    /// Broker settings derived from the broker section
    pub fn broker_config(&self) -> BrokerConfig {
        let b = &self.broker;
        BrokerConfig {
            max_connections: b.max_connections,
            acquire_timeout: Duration::from_millis(b.acquire_timeout_ms),
            max_retries: b.max_retries,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(b.base_delay_ms),
                multiplier: b.multiplier,
                max_delay: Duration::from_millis(b.max_delay_ms),
                jitter: if b.jitter_ms == 0 {
                    Jitter::None
                } else {
                    Jitter::Uniform(Duration::from_millis(b.jitter_ms))
                },
            },
        }
    }
}
