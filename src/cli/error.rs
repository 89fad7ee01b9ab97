//! CLI-specific error types

use thiserror::Error;

use crate::database::{BrokerError, DatabaseError};
use crate::ingest::ManifestError;
use crate::pipeline::PipelineError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Acquisition error: {0}")]
    AcquisitionError(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl CliError {
    /// Process exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidArgument(_) | CliError::IoError(_) => 1,
            CliError::ConfigError(_) => 2,
            CliError::StoreError(_) => 3,
            CliError::ManifestError(_) => 4,
            CliError::AcquisitionError(_) => 5,
            CliError::IntegrityError(_) => 6,
        }
    }
}

impl From<DatabaseError> for CliError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::ConfigError(_) => CliError::ConfigError(e.to_string()),
            DatabaseError::ReadOnlyViolation(_) | DatabaseError::InvalidInput(_) => {
                CliError::InvalidArgument(e.to_string())
            }
            _ => CliError::StoreError(e.to_string()),
        }
    }
}

impl From<BrokerError> for CliError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Database(db) => db.into(),
            BrokerError::AcquisitionTimeout { .. } => CliError::AcquisitionError(e.to_string()),
            BrokerError::ReadOnlyStore | BrokerError::Closed => CliError::StoreError(e.to_string()),
        }
    }
}

impl From<ManifestError> for CliError {
    fn from(e: ManifestError) -> Self {
        CliError::ManifestError(e.to_string())
    }
}

impl From<PipelineError> for CliError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Manifest(m) => m.into(),
            PipelineError::Broker(b) => b.into(),
            PipelineError::Database(d) => d.into(),
            PipelineError::Integrity { .. } => CliError::IntegrityError(e.to_string()),
            PipelineError::SourceDirectory(_) => CliError::InvalidArgument(e.to_string()),
            PipelineError::Unreadable { .. } | PipelineError::Ingest(_) => {
                CliError::IoError(e.to_string())
            }
        }
    }
}
