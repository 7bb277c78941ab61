//! Query Executor
//!
//! Runs SQL against a database and reports either the rows or a classified
//! engine error. Executors do not apply any statement policy; that is the
//! pipeline's job.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        Self {
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms,
        }
    }

    /// The single value of a one-row, one-column result.
    pub fn scalar(&self) -> Option<&serde_json::Value> {
        if self.row_count != 1 || self.columns.len() != 1 {
            return None;
        }
        self.rows.first().and_then(|row| row.get(&self.columns[0]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Syntax,
    /// Unknown table, column or function
    UnknownObject,
    Permission,
    Timeout,
    Connection,
    Other,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionErrorKind::Syntax => "syntax error",
            ExecutionErrorKind::UnknownObject => "unknown object",
            ExecutionErrorKind::Permission => "permission denied",
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::Connection => "connection error",
            ExecutionErrorKind::Other => "execution error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    /// Engine message, unmodified
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutionError>;

    /// Dialect name as shown to the model, e.g. "SQLite"
    fn dialect(&self) -> &str;
}
