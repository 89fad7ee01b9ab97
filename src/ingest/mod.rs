//! Source file ingestion
//!
//! Fingerprinting, the processing manifest, change detection and the bulk
//! loader that appends response extracts to the raw table.

pub mod detect;
pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod manifest;
pub mod record;

pub use detect::{ChangeDetector, ChangeSet, DiscoveredFile, FileStatus, SourceFile, discover_source_files};
pub use error::{IngestError, IngestResult, ManifestError, ManifestResult};
pub use fingerprint::{FileHasher, Fingerprint};
pub use loader::{FailedFile, LoadStats, RawLoader};
pub use manifest::{ManifestEntry, ManifestStore, ProcessingManifest};
pub use record::{AnswerValue, ProficiencyLevel, RawRecord, is_reading_subject, validate_header};
