//! Error types for source ingestion

use std::path::PathBuf;

use thiserror::Error;

use crate::database::DatabaseError;

/// Errors raised while fingerprinting, reading or loading a source file
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema mismatch in {file}: {reason}")]
    SchemaMismatch { file: String, reason: String },

    #[error("Malformed record in {file}: {error}")]
    Csv { file: String, error: String },

    #[error("Invalid source pattern {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl IngestError {
    /// Whether the error only concerns one file
    ///
    /// File-level errors are logged and the file skipped; anything else ends
    /// the run.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            IngestError::Io { .. } | IngestError::SchemaMismatch { .. } | IngestError::Csv { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mismatch(file: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::SchemaMismatch {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for ingestion
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors raised while reading or writing the processing manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest {path} is corrupt: {error}")]
    Corrupt { path: PathBuf, error: String },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(String),
}

/// Result type for manifest persistence
pub type ManifestResult<T> = Result<T, ManifestError>;
