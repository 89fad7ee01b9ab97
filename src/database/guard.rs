//! Read-only statement guard for reporting handles
//!
//! Reader handles share the database instance with the pipeline's writer, so
//! the store itself cannot refuse their writes. Every statement a reader runs
//! is parsed first and only plain queries are let through.

use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

use super::{DatabaseError, DatabaseResult};

/// Accept `sql` only if it is a single read-only statement
pub fn ensure_read_only(sql: &str) -> DatabaseResult<()> {
    if sql.trim().is_empty() {
        return Err(DatabaseError::InvalidInput("Query is empty".to_string()));
    }

    let statements = Parser::parse_sql(&DuckDbDialect {}, sql)
        .map_err(|e| DatabaseError::InvalidInput(format!("Failed to parse query: {}", e)))?;

    match statements.as_slice() {
        [statement] => check_statement(statement),
        [] => Err(DatabaseError::InvalidInput("Query is empty".to_string())),
        _ => Err(DatabaseError::ReadOnlyViolation(
            "multiple statements are not allowed".to_string(),
        )),
    }
}

fn check_statement(statement: &Statement) -> DatabaseResult<()> {
    match statement {
        Statement::Query(query) => check_set_expr(&query.body),
        Statement::Explain { statement, .. } => check_statement(statement),
        other => Err(DatabaseError::ReadOnlyViolation(format!(
            "statement not allowed on a reader: {}",
            first_keyword(&other.to_string())
        ))),
    }
}

fn check_set_expr(body: &SetExpr) -> DatabaseResult<()> {
    match body {
        SetExpr::Select(select) if select.into.is_some() => Err(
            DatabaseError::ReadOnlyViolation("SELECT INTO creates a table".to_string()),
        ),
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        SetExpr::Query(inner) => check_set_expr(&inner.body),
        _ => Err(DatabaseError::ReadOnlyViolation(
            "data-modifying query not allowed on a reader".to_string(),
        )),
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}
