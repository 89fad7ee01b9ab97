//! Materialization pipeline
//!
//! One run walks `Idle -> DetectingChanges -> LoadingRaw -> RebuildingSchema
//! -> UpdatingManifest -> Idle`; any error ends in `Failed`. Full runs skip
//! change detection, drop every managed table and reload all files. The
//! manifest is written only after the rebuild has succeeded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::broker::{BrokerError, ConnectionBroker};
use crate::database::config::WarehouseConfig;
use crate::database::schema::{RAW_TABLE, WarehouseSchema};
use crate::database::DatabaseError;
use crate::ingest::detect::{
    ChangeDetector, DiscoveredFile, FileStatus, SourceFile, discover_source_files,
};
use crate::ingest::error::{IngestError, ManifestError};
use crate::ingest::fingerprint::FileHasher;
use crate::ingest::loader::{FailedFile, RawLoader};
use crate::ingest::manifest::{ManifestStore, ProcessingManifest};
use crate::star::{RebuildError, RebuildStats, StarSchemaBuilder, checkpoint};

/// Error type for pipeline runs
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source directory unavailable: {0}")]
    SourceDirectory(IngestError),

    #[error("Cannot fingerprint {file} during a full load: {source}")]
    Unreadable {
        file: String,
        #[source]
        source: IngestError,
    },

    #[error(transparent)]
    Ingest(IngestError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Integrity violation: {table} has {duplicates} duplicate keys")]
    Integrity { table: String, duplicates: u64 },
}

impl From<IngestError> for PipelineError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Database(db) => PipelineError::Database(db),
            other => PipelineError::Ingest(other),
        }
    }
}

impl From<RebuildError> for PipelineError {
    fn from(e: RebuildError) -> Self {
        match e {
            RebuildError::Integrity { table, duplicates } => {
                PipelineError::Integrity { table, duplicates }
            }
            RebuildError::Database(db) => PipelineError::Database(db),
        }
    }
}

/// Result type for pipeline runs
pub type PipelineResult<T> = Result<T, PipelineError>;

/// How a run treats existing data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Discard the store and reload every source file
    Full,
    /// Load only new or modified files
    Incremental,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Full => write!(f, "full"),
            LoadMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(LoadMode::Full),
            "incremental" => Ok(LoadMode::Incremental),
            _ => Err(format!("Unknown load mode: {}", s)),
        }
    }
}

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    DetectingChanges,
    LoadingRaw,
    RebuildingSchema,
    UpdatingManifest,
    Failed,
}

/// Summary of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: LoadMode,
    pub started_at: DateTime<Utc>,
    /// New or modified files, sorted by name
    pub changed_files: Vec<String>,
    pub unchanged_files: Vec<String>,
    /// Files skipped because they could not be read or validated
    pub failed_files: Vec<FailedFile>,
    /// Files whose rows were committed in this run
    pub files_loaded: Vec<String>,
    pub rows_loaded: u64,
    /// `None` when the rebuild was skipped
    pub rebuild: Option<RebuildStats>,
    /// True when nothing changed and the store was left untouched
    pub skipped: bool,
    pub duration_ms: u64,
}

impl RunReport {
    fn new(run_id: Uuid, mode: LoadMode) -> Self {
        Self {
            run_id,
            mode,
            started_at: Utc::now(),
            changed_files: Vec::new(),
            unchanged_files: Vec::new(),
            failed_files: Vec::new(),
            files_loaded: Vec::new(),
            rows_loaded: 0,
            rebuild: None,
            skipped: false,
            duration_ms: 0,
        }
    }
}

/// Where the pipeline reads from and how it loads
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source_dir: PathBuf,
    pub pattern: String,
    pub manifest_path: PathBuf,
    pub loader: RawLoader,
    pub builder: StarSchemaBuilder,
}

impl PipelineOptions {
    pub fn from_config(config: &WarehouseConfig) -> Self {
        Self {
            source_dir: config.source_dir(),
            pattern: config.source.pattern.clone(),
            manifest_path: config.manifest_path(),
            loader: RawLoader::from_config(config),
            builder: StarSchemaBuilder::new(config.rebuild.partition_size),
        }
    }
}

/// Orchestrates detection, loading, rebuilding and bookkeeping
pub struct MaterializationPipeline {
    broker: Arc<ConnectionBroker>,
    options: PipelineOptions,
    manifests: ManifestStore,
    hasher: FileHasher,
    state: PipelineState,
    transitions: Vec<PipelineState>,
}

impl MaterializationPipeline {
    pub fn new(broker: Arc<ConnectionBroker>, options: PipelineOptions) -> Self {
        let manifests = ManifestStore::new(options.manifest_path.clone());
        Self {
            broker,
            options,
            manifests,
            hasher: FileHasher::new(),
            state: PipelineState::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// States entered during the most recent run, in order
    pub fn transitions(&self) -> &[PipelineState] {
        &self.transitions
    }

    fn transition(&mut self, next: PipelineState) {
        info!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    /// Run the pipeline once
    pub async fn run(&mut self, mode: LoadMode) -> PipelineResult<RunReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        self.transitions.clear();
        info!("Starting {} run {}", mode, run_id);

        let mut report = RunReport::new(run_id, mode);
        match self.execute(mode, &mut report).await {
            Ok(()) => {
                self.transition(PipelineState::Idle);
                report.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    "Run {} finished in {} ms: {} files, {} rows",
                    run_id,
                    report.duration_ms,
                    report.files_loaded.len(),
                    report.rows_loaded
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                error!("Run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    async fn execute(&mut self, mode: LoadMode, report: &mut RunReport) -> PipelineResult<()> {
        let files = discover_source_files(&self.options.source_dir, &self.options.pattern)
            .map_err(PipelineError::SourceDirectory)?;

        let (mut manifest, changed) = match mode {
            LoadMode::Full => {
                // The store is discarded, so earlier entries no longer describe it
                let changed = self.fingerprint_all(&files)?;
                (ProcessingManifest::new(), changed)
            }
            LoadMode::Incremental => {
                self.transition(PipelineState::DetectingChanges);
                let manifest = self.manifests.load()?;
                let set = ChangeDetector::new(self.hasher).detect(&manifest, &files);

                report.unchanged_files = set.unchanged.iter().map(|f| f.name.clone()).collect();
                report.failed_files.extend(set.unreadable.iter().map(|(name, e)| FailedFile {
                    name: name.clone(),
                    reason: e.to_string(),
                }));

                if !set.has_changes() {
                    self.warn_if_raw_missing(&manifest).await?;
                    info!(
                        "No new or modified files ({} unchanged); store left as is",
                        set.unchanged.len()
                    );
                    report.skipped = true;
                    return Ok(());
                }
                (manifest, set.changed)
            }
        };

        report.changed_files = changed.iter().map(|f| f.name.clone()).collect();
        info!("{} file(s) to load", changed.len());

        let writer = self.broker.acquire_writer().await?;
        let conn = writer.connection()?;

        self.transition(PipelineState::LoadingRaw);
        if mode == LoadMode::Full {
            conn.execute_batch(&WarehouseSchema::drop_all_sql())
                .map_err(|e| DatabaseError::QueryFailed(format!("Failed to reset store: {}", e)))?;
            info!("Dropped all warehouse tables for full load");
        }
        let loaded = self.options.loader.load(conn, &changed)?;
        checkpoint(conn);

        report.rows_loaded = loaded.rows_loaded;
        report.files_loaded = loaded.files_loaded.clone();
        report.failed_files.extend(loaded.files_failed.iter().cloned());

        self.transition(PipelineState::RebuildingSchema);
        report.rebuild = Some(self.options.builder.rebuild(conn)?);
        checkpoint(conn);
        drop(writer);

        self.transition(PipelineState::UpdatingManifest);
        let now = Utc::now();
        for file in changed.iter().filter(|f| loaded.files_loaded.contains(&f.name)) {
            manifest.record(file.name.clone(), file.fingerprint, file.size, now);
        }
        if mode == LoadMode::Full {
            manifest.mark_full_load(now);
        }
        self.manifests.save(&manifest)?;

        Ok(())
    }

    /// Fingerprint every file for a full load; an unreadable file is fatal
    fn fingerprint_all(
        &self,
        files: &[DiscoveredFile],
    ) -> PipelineResult<Vec<SourceFile>> {
        files
            .iter()
            .map(|file| {
                let fingerprint =
                    self.hasher
                        .fingerprint(&file.path)
                        .map_err(|source| PipelineError::Unreadable {
                            file: file.name.clone(),
                            source,
                        })?;
                Ok(SourceFile {
                    name: file.name.clone(),
                    path: file.path.clone(),
                    size: file.size,
                    fingerprint,
                    status: FileStatus::New,
                })
            })
            .collect()
    }

    async fn warn_if_raw_missing(&self, manifest: &ProcessingManifest) -> PipelineResult<()> {
        if manifest.is_empty() {
            return Ok(());
        }
        let reader = self.broker.acquire_reader().await?;
        if !reader.table_exists(RAW_TABLE)? {
            warn!(
                "Manifest lists {} file(s) but the store has no raw table; run a full load",
                manifest.len()
            );
        }
        Ok(())
    }
}
