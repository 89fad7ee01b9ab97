//! Bulk loading of source files into the raw table

use std::fs::File;
use std::io::BufReader;

use duckdb::{Appender, Connection, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::detect::SourceFile;
use super::error::{IngestError, IngestResult};
use super::record::{RawRecord, validate_header};
use crate::database::config::WarehouseConfig;
use crate::database::schema::{RAW_TABLE, SOURCE_FILE_COLUMN, WarehouseSchema};
use crate::database::DatabaseError;

/// Outcome of loading a batch of files
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    /// Files whose rows were committed, in load order
    pub files_loaded: Vec<String>,
    /// Files skipped because of a file-level error
    pub files_failed: Vec<FailedFile>,
    /// Rows appended across all loaded files
    pub rows_loaded: u64,
}

/// A file the loader skipped
#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub name: String,
    pub reason: String,
}

/// Appends source files to the raw table
#[derive(Debug, Clone)]
pub struct RawLoader {
    delimiter: u8,
    batch_size: usize,
}

impl Default for RawLoader {
    fn default() -> Self {
        Self {
            delimiter: b',',
            batch_size: 50_000,
        }
    }
}

impl RawLoader {
    pub fn new(delimiter: u8, batch_size: usize) -> Self {
        Self {
            delimiter,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &WarehouseConfig) -> Self {
        Self::new(config.source.delimiter as u8, config.load.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Create the raw table if it does not exist yet
    pub fn ensure_raw_table(&self, conn: &Connection) -> IngestResult<()> {
        conn.execute_batch(WarehouseSchema::create_raw_sql())
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to create raw table: {}", e)))?;
        Ok(())
    }

    /// Load every file, skipping those with file-level errors
    ///
    /// Store errors abort the batch; files loaded before the failure stay
    /// committed.
    pub fn load(&self, conn: &Connection, files: &[SourceFile]) -> IngestResult<LoadStats> {
        self.ensure_raw_table(conn)?;

        let mut stats = LoadStats::default();
        for file in files {
            match self.load_file(conn, file) {
                Ok(rows) => {
                    info!("Loaded {} rows from {}", rows, file.name);
                    stats.rows_loaded += rows;
                    stats.files_loaded.push(file.name.clone());
                }
                Err(e) if e.is_file_level() => {
                    warn!("Skipping {}: {}", file.name, e);
                    stats.files_failed.push(FailedFile {
                        name: file.name.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(stats)
    }

    /// Load one file inside its own transaction
    ///
    /// Rows from an earlier load of the same filename are replaced. Either
    /// every row of the file is committed or none is.
    pub fn load_file(&self, conn: &Connection, file: &SourceFile) -> IngestResult<u64> {
        let handle = File::open(&file.path).map_err(|e| IngestError::io(&file.path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(BufReader::new(handle));

        let header = reader.headers().map_err(|e| csv_error(file, e))?.clone();
        validate_header(&file.name, &header)?;

        conn.execute_batch("BEGIN TRANSACTION").map_err(|e| {
            DatabaseError::TransactionFailed(format!("begin for {}: {}", file.name, e))
        })?;

        match self.append_rows(conn, file, &mut reader) {
            Ok(rows) => {
                conn.execute_batch("COMMIT").map_err(|e| {
                    DatabaseError::TransactionFailed(format!("commit for {}: {}", file.name, e))
                })?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    return Err(DatabaseError::TransactionFailed(format!(
                        "rollback for {} after \"{}\": {}",
                        file.name, e, rollback
                    ))
                    .into());
                }
                Err(e)
            }
        }
    }

    fn append_rows(
        &self,
        conn: &Connection,
        file: &SourceFile,
        reader: &mut csv::Reader<BufReader<File>>,
    ) -> IngestResult<u64> {
        let replaced = conn
            .execute(
                &format!("DELETE FROM {} WHERE {} = ?", RAW_TABLE, SOURCE_FILE_COLUMN),
                [&file.name],
            )
            .map_err(|e| {
                DatabaseError::QueryFailed(format!("Failed to clear {}: {}", file.name, e))
            })?;
        if replaced > 0 {
            info!("Replacing {} rows previously loaded from {}", replaced, file.name);
        }

        let mut appender = conn.appender(RAW_TABLE).map_err(|e| {
            DatabaseError::QueryFailed(format!("Failed to create appender on {}: {}", RAW_TABLE, e))
        })?;

        let mut rows: u64 = 0;
        let mut pending = 0usize;

        for result in reader.records() {
            let row = result.map_err(|e| csv_error(file, e))?;
            let record = RawRecord::from_row(&row).map_err(|reason| {
                let line = row.position().map(|p| p.line()).unwrap_or(0);
                IngestError::mismatch(&file.name, format!("line {}: {}", line, reason))
            })?;

            append_record(&mut appender, &record, &file.name)?;
            rows += 1;
            pending += 1;

            if pending >= self.batch_size {
                appender
                    .flush()
                    .map_err(|e| DatabaseError::QueryFailed(format!("Appender flush: {}", e)))?;
                debug!("Flushed {} rows from {} ({} so far)", pending, file.name, rows);
                pending = 0;
            }
        }

        appender
            .flush()
            .map_err(|e| DatabaseError::QueryFailed(format!("Appender flush: {}", e)))?;
        Ok(rows)
    }
}

fn append_record(appender: &mut Appender<'_>, r: &RawRecord, source_file: &str) -> IngestResult<()> {
    appender
        .append_row(params![
            r.geography_code,
            r.geography_name,
            r.institution_code,
            r.institution_name,
            r.grade_number,
            r.grade_name,
            r.period_code,
            r.period_name,
            r.student_id,
            r.student_name,
            r.student_national_id,
            r.assessment_name,
            r.assessment_year,
            r.subject_name,
            r.test_name,
            r.question_order,
            r.raw_answer,
            r.answer.correct_flag(),
            r.descriptor_code,
            r.descriptor_text,
            source_file,
        ])
        .map_err(|e| DatabaseError::QueryFailed(format!("Append failed: {}", e)))?;
    Ok(())
}

fn csv_error(file: &SourceFile, e: csv::Error) -> IngestError {
    IngestError::Csv {
        file: file.name.clone(),
        error: e.to_string(),
    }
}
