//! CLI command implementations

pub mod diagnose;
pub mod query;
pub mod run;
pub mod stats;

use std::path::PathBuf;

use crate::cli::error::CliError;
use crate::database::config::CONFIG_FILENAME;
use crate::database::duckdb::StoreLocation;
use crate::database::{ConnectionBroker, WarehouseConfig};

/// Options shared by every command
#[derive(Debug, Clone, Default)]
pub struct StoreArgs {
    /// Explicit configuration file; defaults to `warehouse.toml` in the working directory
    pub config: Option<PathBuf>,
    /// Store path override
    pub db_path: Option<PathBuf>,
    /// Source directory override
    pub data_path: Option<PathBuf>,
    /// Manifest path override
    pub manifest: Option<PathBuf>,
}

/// Load configuration, then apply command-line overrides
pub fn load_config(args: &StoreArgs) -> Result<WarehouseConfig, CliError> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));
    if args.config.is_some() && !path.exists() {
        return Err(CliError::ConfigError(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let mut config = WarehouseConfig::load_from(&path)?;
    if let Some(db_path) = &args.db_path {
        config.store.path = db_path.to_string_lossy().into_owned();
    }
    if let Some(data_path) = &args.data_path {
        config.source.dir = data_path.to_string_lossy().into_owned();
    }
    if let Some(manifest) = &args.manifest {
        config.manifest.path = manifest.to_string_lossy().into_owned();
    }
    Ok(config)
}

/// Open the configured store behind a broker
pub fn open_broker(config: &WarehouseConfig, read_only: bool) -> Result<ConnectionBroker, CliError> {
    let mut options = config.store_options();
    options.read_only = read_only;
    Ok(ConnectionBroker::open(
        StoreLocation::File(config.store_path()),
        &options,
        config.broker_config(),
    )?)
}

/// Runtime for the async broker and pipeline
pub fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("warehouse.toml");
        std::fs::write(&config_path, "[store]\npath = \"from-file.duckdb\"\n").unwrap();

        let args = StoreArgs {
            config: Some(config_path),
            db_path: Some(PathBuf::from("from-flag.duckdb")),
            data_path: Some(PathBuf::from("extracts")),
            manifest: None,
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.store.path, "from-flag.duckdb");
        assert_eq!(config.source.dir, "extracts");
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = StoreArgs {
            config: Some(PathBuf::from("/nonexistent/warehouse.toml")),
            ..Default::default()
        };
        assert_eq!(load_config(&args).unwrap_err().exit_code(), 2);
    }
}
