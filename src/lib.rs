//! Assessment Warehouse - incremental loading and star-schema materialization
//!
//! Loads student response extracts (one row per student-question response)
//! into an embedded DuckDB store and keeps a star schema derived from them:
//! - `ingest`: fingerprinting, the processing manifest, change detection and
//!   the bulk raw loader
//! - `star`: the dimension and fact rebuild
//! - `pipeline`: the run state machine tying the two together
//! - `database`: store access, configuration and the connection broker that
//!   bounds concurrent readers and serialises the writer
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assessment_warehouse::{
//!     ConnectionBroker, LoadMode, MaterializationPipeline, PipelineOptions, WarehouseConfig,
//! };
//! use assessment_warehouse::database::duckdb::StoreLocation;
//!
//! let config = WarehouseConfig::load(std::path::Path::new("."))?;
//! let broker = Arc::new(ConnectionBroker::open(
//!     StoreLocation::File(config.store_path()),
//!     &config.store_options(),
//!     config.broker_config(),
//! )?);
//!
//! let mut pipeline = MaterializationPipeline::new(broker, PipelineOptions::from_config(&config));
//! let report = pipeline.run(LoadMode::Incremental).await?;
//! println!("{} rows from {} files", report.rows_loaded, report.files_loaded.len());
//! ```

pub mod database;
pub mod ingest;
pub mod pipeline;
pub mod star;

#[cfg(feature = "cli")]
pub mod cli;

pub use database::{
    BackoffPolicy, BrokerConfig, BrokerError, BrokerStats, ConnectionBroker, DatabaseError,
    Jitter, OutputFormat, QueryResult, Role, StoreHandle, WarehouseConfig,
};
pub use ingest::{
    ChangeDetector, FileHasher, Fingerprint, IngestError, ManifestError, ManifestStore,
    ProcessingManifest, RawLoader,
};
pub use pipeline::{
    LoadMode, MaterializationPipeline, PipelineError, PipelineOptions, PipelineState, RunReport,
};
pub use star::{RebuildError, RebuildStats, StarSchemaBuilder};
