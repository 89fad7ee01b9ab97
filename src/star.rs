//! Star schema rebuild
//!
//! Every derived table is recomputed from the complete raw table on each
//! rebuild. Dimensions keep exactly one row per key: when raw rows disagree
//! about a key's attributes, the lexicographically greatest attribute tuple
//! wins (nulls sort last). The response fact can be aggregated in
//! institution-range partitions to bound memory; the result is the same set
//! of rows as a single aggregation.

use duckdb::{Connection, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::broker::StoreHandle;
use crate::database::duckdb::count_rows;
use crate::database::schema::{
    DIM_DESCRIPTOR, DIM_SCHOOL, DIM_STUDENT, FACT_READING_PROFICIENCY, FACT_RESPONSE_SUMMARY,
    RAW_TABLE, WarehouseSchema,
};
use crate::database::{DatabaseError, DatabaseResult};
use crate::ingest::record::{ProficiencyLevel, READING_SUBJECTS};

/// Error type for the rebuild
#[derive(Error, Debug)]
pub enum RebuildError {
    /// A dimension ended up with more than one row for some key
    #[error("Integrity violation: {table} has {duplicates} duplicate keys")]
    Integrity { table: String, duplicates: u64 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type for the rebuild
pub type RebuildResult<T> = Result<T, RebuildError>;

/// Row counts of the rebuilt tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub student_count: u64,
    pub school_count: u64,
    pub descriptor_count: u64,
    pub fact_rows: u64,
    pub reading_fact_rows: u64,
    /// Aggregation passes used for the response fact
    pub partitions: usize,
}

/// Rebuilds dimensions and facts from the raw table
#[derive(Debug, Clone, Default)]
pub struct StarSchemaBuilder {
    partition_size: usize,
}

impl StarSchemaBuilder {
    /// `partition_size` institutions per fact pass; 0 means one pass
    pub fn new(partition_size: usize) -> Self {
        Self { partition_size }
    }

    /// Drop and recreate every derived table
    pub fn rebuild(&self, conn: &Connection) -> RebuildResult<RebuildStats> {
        exec(conn, WarehouseSchema::create_raw_sql(), "ensure raw table")?;

        exec(conn, WarehouseSchema::drop_derived_sql(), "drop derived tables")?;
        exec(conn, WarehouseSchema::create_dimensions_sql(), "create dimensions")?;
        exec(conn, WarehouseSchema::create_fact_sql(), "create response fact")?;
        exec(conn, WarehouseSchema::create_reading_fact_sql(), "create reading fact")?;

        exec(conn, &student_dimension_sql(), "populate dim_student")?;
        exec(conn, &school_dimension_sql(), "populate dim_school")?;
        exec(conn, &descriptor_dimension_sql(), "populate dim_descriptor")?;

        let partitions = if self.partition_size == 0 {
            exec(conn, &response_fact_sql(false), "populate fact_response_summary")?;
            1
        } else {
            self.build_fact_partitioned(conn)?
        };

        exec(conn, &reading_fact_sql(), "populate fact_reading_proficiency")?;

        check_unique(conn, DIM_STUDENT, "student_id")?;
        check_unique(conn, DIM_SCHOOL, "institution_code")?;
        check_unique(conn, DIM_DESCRIPTOR, "descriptor_code")?;

        let stats = RebuildStats {
            student_count: count_rows(conn, DIM_STUDENT)?,
            school_count: count_rows(conn, DIM_SCHOOL)?,
            descriptor_count: count_rows(conn, DIM_DESCRIPTOR)?,
            fact_rows: count_rows(conn, FACT_RESPONSE_SUMMARY)?,
            reading_fact_rows: count_rows(conn, FACT_READING_PROFICIENCY)?,
            partitions,
        };

        info!(
            "Rebuilt star schema: {} students, {} schools, {} descriptors, {} fact rows, {} reading rows",
            stats.student_count,
            stats.school_count,
            stats.descriptor_count,
            stats.fact_rows,
            stats.reading_fact_rows
        );
        Ok(stats)
    }

    fn build_fact_partitioned(&self, conn: &Connection) -> RebuildResult<usize> {
        let codes = institution_codes(conn)?;
        let sql = response_fact_sql(true);
        let mut partitions = 0;

        for chunk in codes.chunks(self.partition_size) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let inserted = conn.execute(&sql, params![first, last]).map_err(|e| {
                DatabaseError::QueryFailed(format!(
                    "fact partition {}..={}: {}",
                    first, last, e
                ))
            })?;
            partitions += 1;
            debug!(
                "Fact partition {} ({}..={}): {} rows",
                partitions, first, last, inserted
            );
            checkpoint(conn);
        }

        Ok(partitions)
    }
}

fn exec(conn: &Connection, sql: &str, step: &str) -> DatabaseResult<()> {
    conn.execute_batch(sql)
        .map_err(|e| DatabaseError::QueryFailed(format!("{}: {}", step, e)))
}

/// Flush the WAL; failure only costs memory, never correctness
pub(crate) fn checkpoint(conn: &Connection) {
    if let Err(e) = conn.execute_batch("CHECKPOINT") {
        warn!("CHECKPOINT skipped: {}", e);
    }
}

fn institution_codes(conn: &Connection) -> DatabaseResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT institution_code FROM {} WHERE correct IS NOT NULL ORDER BY institution_code",
        RAW_TABLE
    ))?;
    let codes = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(codes)
}

fn student_dimension_sql() -> String {
    format!(
        "INSERT INTO {dim}
SELECT student_id, student_name, student_national_id
FROM (SELECT DISTINCT student_id, student_name, student_national_id FROM {raw})
QUALIFY row_number() OVER (
    PARTITION BY student_id
    ORDER BY student_name DESC NULLS LAST, student_national_id DESC NULLS LAST
) = 1",
        dim = DIM_STUDENT,
        raw = RAW_TABLE
    )
}

fn school_dimension_sql() -> String {
    format!(
        "INSERT INTO {dim}
SELECT institution_code, institution_name
FROM (SELECT DISTINCT institution_code, institution_name FROM {raw})
QUALIFY row_number() OVER (
    PARTITION BY institution_code
    ORDER BY institution_name DESC NULLS LAST
) = 1",
        dim = DIM_SCHOOL,
        raw = RAW_TABLE
    )
}

fn descriptor_dimension_sql() -> String {
    format!(
        "INSERT INTO {dim}
SELECT descriptor_code, max(descriptor_text), count(*)
FROM {raw}
WHERE descriptor_code IS NOT NULL
GROUP BY descriptor_code",
        dim = DIM_DESCRIPTOR,
        raw = RAW_TABLE
    )
}

/// Response fact aggregation; reading rows carry no correctness and are left out
fn response_fact_sql(partitioned: bool) -> String {
    let grain = WarehouseSchema::fact_grain_list();
    let range = if partitioned {
        "\n  AND institution_code >= ? AND institution_code <= ?"
    } else {
        ""
    };
    format!(
        "INSERT INTO {fact}
SELECT {grain},
       SUM(CASE WHEN correct = 1 THEN 1 ELSE 0 END)::BIGINT,
       SUM(CASE WHEN correct = 0 THEN 1 ELSE 0 END)::BIGINT
FROM {raw}
WHERE correct IS NOT NULL{range}
GROUP BY {grain}",
        fact = FACT_RESPONSE_SUMMARY,
        raw = RAW_TABLE,
    )
}

fn reading_subject_filter() -> String {
    let names: Vec<String> = READING_SUBJECTS.iter().map(|s| format!("'{}'", s)).collect();
    format!("lower(trim(subject_name)) IN ({})", names.join(", "))
}

fn reading_fact_sql() -> String {
    let grain = WarehouseSchema::reading_grain_list();
    let rank = ProficiencyLevel::rank_case_sql("raw_answer");
    format!(
        "INSERT INTO {fact}
SELECT {grain}, raw_answer, {rank}, COUNT(*)
FROM {raw}
WHERE {filter} AND {rank} IS NOT NULL
GROUP BY {grain}, raw_answer",
        fact = FACT_READING_PROFICIENCY,
        raw = RAW_TABLE,
        filter = reading_subject_filter(),
    )
}

fn check_unique(conn: &Connection, table: &str, key: &str) -> RebuildResult<()> {
    let duplicates: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) - COUNT(DISTINCT {}) FROM {}", key, table),
            [],
            |row| row.get(0),
        )
        .map_err(|e| DatabaseError::QueryFailed(format!("integrity check on {}: {}", table, e)))?;

    if duplicates > 0 {
        return Err(RebuildError::Integrity {
            table: table.to_string(),
            duplicates: duplicates as u64,
        });
    }
    Ok(())
}

/// Row count of one managed table; `None` when it does not exist
#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub table: String,
    pub rows: Option<u64>,
}

/// Row counts of every managed table, through any handle
pub fn table_counts(handle: &StoreHandle) -> DatabaseResult<Vec<TableCount>> {
    WarehouseSchema::managed_tables()
        .iter()
        .map(|table| {
            let rows = if handle.table_exists(table)? {
                Some(handle.count_rows(table)?)
            } else {
                None
            };
            Ok(TableCount {
                table: table.to_string(),
                rows,
            })
        })
        .collect()
}

/// A student identifier whose raw rows disagree on identity attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictingStudent {
    pub student_id: i64,
    pub names: Vec<String>,
    pub national_ids: Vec<String>,
}

/// Student identifiers with more than one distinct name or national ID
///
/// These are the keys whose dimension row is chosen by the tie-break.
pub fn find_conflicting_students(
    handle: &StoreHandle,
    limit: usize,
) -> DatabaseResult<Vec<ConflictingStudent>> {
    if !handle.table_exists(RAW_TABLE)? {
        return Ok(Vec::new());
    }

    let sql = format!(
        "WITH names AS (
    SELECT student_id, COUNT(DISTINCT student_name) AS n,
           string_agg(DISTINCT student_name, chr(31)) AS vals
    FROM {raw} GROUP BY student_id
),
ids AS (
    SELECT student_id, COUNT(DISTINCT student_national_id) AS n,
           string_agg(DISTINCT student_national_id, chr(31)) AS vals
    FROM {raw} GROUP BY student_id
)
SELECT names.student_id AS student_id, names.vals AS names, ids.vals AS national_ids
FROM names JOIN ids ON names.student_id = ids.student_id
WHERE names.n > 1 OR ids.n > 1
ORDER BY names.student_id
LIMIT {limit}",
        raw = RAW_TABLE,
        limit = limit
    );

    let result = handle.query(&sql)?;
    result
        .rows
        .iter()
        .map(|row| {
            let student_id = row["student_id"].as_i64().ok_or_else(|| {
                DatabaseError::QueryFailed(format!("unexpected student_id {}", row["student_id"]))
            })?;
            Ok(ConflictingStudent {
                student_id,
                names: split_values(&row["names"]),
                national_ids: split_values(&row["national_ids"]),
            })
        })
        .collect()
}

fn split_values(value: &serde_json::Value) -> Vec<String> {
    let mut values: Vec<String> = value
        .as_str()
        .map(|s| s.split('\u{1f}').map(str::to_string).collect())
        .unwrap_or_default();
    values.sort();
    values
}
