//! DuckDB store access
//!
//! Opening the store file and the small set of query helpers shared by the
//! loader, the star schema builder and reporting handles.

use std::path::{Path, PathBuf};

use duckdb::types::ValueRef;
use duckdb::{AccessMode, Config, Connection};

use super::{DatabaseError, DatabaseResult, QueryResult};

/// Where the store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A DuckDB database file
    File(PathBuf),
    /// A private in-memory database (tests, dry runs)
    InMemory,
}

impl StoreLocation {
    /// Path of the store file, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreLocation::File(path) => Some(path),
            StoreLocation::InMemory => None,
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::InMemory => write!(f, ":memory:"),
        }
    }
}

/// Options applied when the store is opened
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// DuckDB `memory_limit`, e.g. "4GB"
    pub memory_limit: Option<String>,
    /// DuckDB worker threads
    pub threads: Option<u32>,
    /// Open the file read-only; writers are refused by DuckDB itself
    pub read_only: bool,
}

/// Open the store and return the root connection
///
/// Further connections are cloned from this one so that every handle shares
/// a single database instance.
pub fn open_store(location: &StoreLocation, options: &StoreOptions) -> DatabaseResult<Connection> {
    let config = build_config(options)?;

    let connection = match location {
        StoreLocation::File(path) => {
            if options.read_only && !path.exists() {
                return Err(DatabaseError::ConnectionFailed(format!(
                    "Store not found: {}",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !options.read_only
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::IoError(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            Connection::open_with_flags(path, config)
        }
        StoreLocation::InMemory => Connection::open_in_memory_with_flags(config),
    };

    connection.map_err(|e| {
        DatabaseError::ConnectionFailed(format!("Failed to open DuckDB at {}: {}", location, e))
    })
}

fn build_config(options: &StoreOptions) -> DatabaseResult<Config> {
    let mut config = Config::default();

    if options.read_only {
        config = config
            .access_mode(AccessMode::ReadOnly)
            .map_err(|e| DatabaseError::ConfigError(format!("access_mode: {}", e)))?;
    }
    if let Some(limit) = &options.memory_limit {
        config = config
            .max_memory(limit)
            .map_err(|e| DatabaseError::ConfigError(format!("memory_limit: {}", e)))?;
    }
    if let Some(threads) = options.threads {
        config = config
            .threads(i64::from(threads))
            .map_err(|e| DatabaseError::ConfigError(format!("threads: {}", e)))?;
    }

    Ok(config)
}

/// Check whether a table exists in the main schema
pub fn table_exists(conn: &Connection, table: &str) -> DatabaseResult<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'main' AND table_name = ?",
            [table],
            |row| row.get(0),
        )
        .map_err(|e| DatabaseError::QueryFailed(format!("table lookup for {}: {}", table, e)))?;
    Ok(count > 0)
}

/// Row count of a table
pub fn count_rows(conn: &Connection, table: &str) -> DatabaseResult<u64> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .map_err(|e| DatabaseError::QueryFailed(format!("count of {}: {}", table, e)))?;
    Ok(count as u64)
}

/// Run a query and collect every row as a JSON object
pub fn query_json(conn: &Connection, sql: &str) -> DatabaseResult<QueryResult> {
    let start = std::time::Instant::now();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

    let mut result_rows = stmt
        .query([])
        .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

    // Column metadata is only available once the statement has executed
    let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
    let columns: Vec<String> = (0..column_count)
        .map(|i| {
            result_rows
                .as_ref()
                .and_then(|r| r.column_name(i).ok())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("col{}", i))
        })
        .collect();
    let columns = unique_column_names(columns);

    let mut rows = Vec::new();
    while let Some(row) = result_rows
        .next()
        .map_err(|e| DatabaseError::QueryFailed(format!("Row fetch error: {}", e)))?
    {
        let mut map = serde_json::Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map(value_ref_to_json)
                .unwrap_or(serde_json::Value::Null);
            map.insert(name.clone(), value);
        }
        rows.push(serde_json::Value::Object(map));
    }

    Ok(QueryResult {
        columns,
        rows,
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

/// Suffix repeated column names (`x`, `x_1`, ...) so every column gets its own key
fn unique_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, suffix);
                suffix += 1;
            }
            candidate
        })
        .collect()
}

/// Convert a DuckDB value to JSON
///
/// Integers wider than 64 bits and temporal values are rendered as strings.
fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    use serde_json::Value;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => i.into(),
        ValueRef::SmallInt(i) => i.into(),
        ValueRef::Int(i) => i.into(),
        ValueRef::BigInt(i) => i.into(),
        ValueRef::UTinyInt(i) => i.into(),
        ValueRef::USmallInt(i) => i.into(),
        ValueRef::UInt(i) => i.into(),
        ValueRef::UBigInt(i) => i.into(),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => small.into(),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Decimal(d) => Value::String(d.to_string()),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_helpers() {
        let conn = open_store(&StoreLocation::InMemory, &StoreOptions::default()).unwrap();
        assert!(!table_exists(&conn, "t").unwrap());

        conn.execute_batch("CREATE TABLE t (a INTEGER, b VARCHAR); INSERT INTO t VALUES (1, 'x'), (2, NULL);")
            .unwrap();
        assert!(table_exists(&conn, "t").unwrap());
        assert_eq!(count_rows(&conn, "t").unwrap(), 2);

        let result = query_json(&conn, "SELECT a, b FROM t ORDER BY a").unwrap();
        assert_eq!(result.columns, vec!["a", "b"]);
        assert_eq!(result.rows[0]["a"], serde_json::json!(1));
        assert_eq!(result.rows[0]["b"], serde_json::json!("x"));
        assert!(result.rows[1]["b"].is_null());
    }

    #[test]
    fn test_duplicate_column_names_keep_every_value() {
        let conn = open_store(&StoreLocation::InMemory, &StoreOptions::default()).unwrap();
        conn.execute_batch(
            "CREATE TABLE a (x INTEGER); CREATE TABLE b (x INTEGER); \
             INSERT INTO a VALUES (1); INSERT INTO b VALUES (2);",
        )
        .unwrap();

        let result = query_json(&conn, "SELECT a.x, b.x, 3 AS x_1 FROM a, b").unwrap();
        assert_eq!(result.columns, vec!["x", "x_1", "x_1_1"]);
        assert_eq!(result.rows[0]["x"], serde_json::json!(1));
        assert_eq!(result.rows[0]["x_1"], serde_json::json!(2));
        assert_eq!(result.rows[0]["x_1_1"], serde_json::json!(3));
    }

    #[test]
    fn test_hugeint_sums_fit_in_json_numbers() {
        let conn = open_store(&StoreLocation::InMemory, &StoreOptions::default()).unwrap();
        let result = query_json(&conn, "SELECT SUM(x)::HUGEINT AS s FROM range(4) t(x)").unwrap();
        assert_eq!(result.rows[0]["s"], serde_json::json!(6));
    }

    #[test]
    fn test_read_only_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let location = StoreLocation::File(dir.path().join("absent.duckdb"));
        let options = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        assert!(matches!(
            open_store(&location, &options),
            Err(DatabaseError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_file_store_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("warehouse.duckdb");
        let location = StoreLocation::File(path.clone());
        let conn = open_store(&location, &StoreOptions::default()).unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER)").unwrap();
        drop(conn);
        assert!(path.exists());
    }
}
