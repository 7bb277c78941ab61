//! PostgreSQL executor and catalog source over a sqlx pool.

use super::{ExecutionError, ExecutionErrorKind, QueryExecutor, QueryResult, Row};
use crate::catalog::{CatalogSource, ForeignKey, PrimaryKey, SchemaCatalog, SchemaEntry};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row as _, Statement, TypeInfo};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    timeout: Duration,
}

impl PostgresDatabase {
    pub async fn connect(database_url: &str, max_connections: u32, timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("Connected to PostgreSQL ({} max connections)", max_connections);
        Ok(Self::from_pool(pool, timeout))
    }

    pub fn from_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn run_query(&self, sql: &str) -> std::result::Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await.map_err(to_execution_error)?;
        let statement = (&mut *conn).prepare(sql).await.map_err(to_execution_error)?;
        let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = statement
            .query()
            .fetch_all(&mut *conn)
            .await
            .map_err(to_execution_error)?;

        let rows = rows
            .iter()
            .map(|row| {
                let mut record = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    record.insert(name.clone(), decode_column(row, i));
                }
                record
            })
            .collect();
        Ok(QueryResult::new(columns, rows, started.elapsed().as_millis() as u64))
    }
}

/// Map an SQLSTATE (or the lack of one) onto an execution error kind.
pub fn classify_sqlstate(code: Option<&str>) -> ExecutionErrorKind {
    match code {
        Some("42601") => ExecutionErrorKind::Syntax,
        Some("42703") | Some("42P01") | Some("42883") | Some("3F000") => ExecutionErrorKind::UnknownObject,
        Some("42501") => ExecutionErrorKind::Permission,
        Some("57014") => ExecutionErrorKind::Timeout,
        Some(code) if code.starts_with("08") => ExecutionErrorKind::Connection,
        _ => ExecutionErrorKind::Other,
    }
}

fn to_execution_error(err: sqlx::Error) -> ExecutionError {
    let kind = match &err {
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            ExecutionErrorKind::Connection
        }
        _ => ExecutionErrorKind::Other,
    };
    ExecutionError::new(kind, err.to_string())
}

/// Decode one cell by its Postgres type. Types without a JSON mapping are
/// reported as a placeholder string rather than failing the whole result.
fn decode_column(row: &PgRow, index: usize) -> serde_json::Value {
    use serde_json::{json, Value};

    let type_name = row.column(index).type_info().name().to_string();
    let decoded: std::result::Result<Value, sqlx::Error> = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| json!(v)),
        "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| json!(v)),
        "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| json!(v)),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| json!(v)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| json!(v)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| json!(v)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => {
            row.try_get::<Option<String>, _>(index).map(|v| json!(v))
        }
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null)),
        "UUID" => row.try_get::<Option<uuid::Uuid>, _>(index).map(|v| json!(v)),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| json!(v)),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| json!(v)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| json!(v)),
        // Numeric needs a decimal crate; cast in SQL to get the value
        other => Ok(json!(format!("<{}>", other))),
    };

    decoded.unwrap_or_else(|e| {
        warn!("Could not decode column {} ({}): {}", index, type_name, e);
        Value::Null
    })
}

#[async_trait]
impl QueryExecutor for PostgresDatabase {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryResult, ExecutionError> {
        match tokio::time::timeout(self.timeout, self.run_query(sql)).await {
            Ok(result) => {
                if let Ok(ref r) = result {
                    info!("PostgreSQL returned {} rows in {} ms", r.row_count, r.execution_time_ms);
                }
                result
            }
            Err(_) => {
                warn!("PostgreSQL query exceeded {:?}", self.timeout);
                Err(ExecutionError::new(
                    ExecutionErrorKind::Timeout,
                    format!("query exceeded {} ms", self.timeout.as_millis()),
                ))
            }
        }
    }

    fn dialect(&self) -> &str {
        "PostgreSQL"
    }
}

#[async_trait]
impl CatalogSource for PostgresDatabase {
    async fn fetch_catalog(&self, data_source: Option<&str>) -> Result<SchemaCatalog> {
        let schema = data_source.unwrap_or(DEFAULT_SCHEMA);

        let column_rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT c.table_name::text, c.column_name::text
             FROM information_schema.columns c
             JOIN information_schema.tables t
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name
             WHERE c.table_schema = $1 AND t.table_type = 'BASE TABLE'
             ORDER BY c.table_name, c.ordinal_position",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Text2SqlError::Catalog(format!("Failed to read columns of {}: {}", schema, e)))?;

        let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (table, column) in column_rows {
            tables.entry(table).or_default().push(column);
        }

        let fk_rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT kcu.table_name::text, kcu.column_name::text,
                    ccu.table_name::text, ccu.column_name::text
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
             JOIN information_schema.constraint_column_usage ccu
               ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
             ORDER BY kcu.table_name, kcu.ordinal_position",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Text2SqlError::Catalog(format!("Failed to read foreign keys of {}: {}", schema, e)))?;

        let pk_rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT kcu.table_name::text, kcu.column_name::text
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1
             ORDER BY kcu.table_name, kcu.ordinal_position",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Text2SqlError::Catalog(format!("Failed to read primary keys of {}: {}", schema, e)))?;

        let catalog = SchemaCatalog {
            data_source: schema.to_string(),
            tables: tables
                .into_iter()
                .map(|(table, columns)| SchemaEntry::new(table, columns))
                .collect(),
            foreign_keys: fk_rows
                .into_iter()
                .map(|(table, column, referred_table, referred_column)| ForeignKey {
                    table,
                    column,
                    referred_table,
                    referred_column,
                })
                .collect(),
            primary_keys: pk_rows
                .into_iter()
                .map(|(table, column)| PrimaryKey { table, column })
                .collect(),
        };

        info!(
            "Fetched PostgreSQL catalog '{}': {} tables, {} foreign keys",
            catalog.data_source,
            catalog.tables.len(),
            catalog.foreign_keys.len()
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate(Some("42601")), ExecutionErrorKind::Syntax);
        assert_eq!(classify_sqlstate(Some("42703")), ExecutionErrorKind::UnknownObject);
        assert_eq!(classify_sqlstate(Some("42P01")), ExecutionErrorKind::UnknownObject);
        assert_eq!(classify_sqlstate(Some("42501")), ExecutionErrorKind::Permission);
        assert_eq!(classify_sqlstate(Some("57014")), ExecutionErrorKind::Timeout);
        assert_eq!(classify_sqlstate(Some("08006")), ExecutionErrorKind::Connection);
        assert_eq!(classify_sqlstate(Some("23505")), ExecutionErrorKind::Other);
        assert_eq!(classify_sqlstate(None), ExecutionErrorKind::Other);
    }

    #[test]
    fn test_pool_timeout_is_a_connection_error() {
        let err = to_execution_error(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind, ExecutionErrorKind::Connection);
    }
}
