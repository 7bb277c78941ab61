use crate::executor::ExecutionError;
use crate::extract::ExtractionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("Schema linking failed: {reason}")]
    SchemaLink {
        reason: String,
        raw_output: Option<String>,
    },

    #[error("Classification failed: unrecognized label {label:?}")]
    Classification { label: String, raw_output: String },

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("LLM provider still throttling after {attempts} attempts: {last_error}")]
    GenerationTransient { attempts: usize, last_error: String },

    #[error("Unsafe statement rejected: {0}")]
    UnsafeStatementRejected(String),

    #[error("Query failed after one correction attempt: {error}")]
    UnrecoverableQuery {
        last_sql: String,
        error: ExecutionError,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pipeline state: {0}")]
    State(String),

    #[error("Stage timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Text2SqlError {
    fn from(err: rusqlite::Error) -> Self {
        Text2SqlError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for Text2SqlError {
    fn from(err: sqlx::Error) -> Self {
        Text2SqlError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for Text2SqlError {
    fn from(err: reqwest::Error) -> Self {
        Text2SqlError::Llm(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;
