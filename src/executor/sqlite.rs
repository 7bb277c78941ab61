//! SQLite executor and catalog source.
//!
//! rusqlite is blocking, so every call runs on the blocking pool. Calls
//! queue on the connection lock; the timeout starts once a call holds the
//! lock. A query that outlives it is interrupted through the connection's
//! interrupt handle, but only while that same call owns the connection.

use super::{ExecutionError, ExecutionErrorKind, QueryExecutor, QueryResult, Row};
use crate::catalog::{CatalogSource, ForeignKey, PrimaryKey, SchemaCatalog, SchemaEntry};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Id of the call currently running a statement on `conn`.
    active: Arc<Mutex<Option<u64>>>,
    next_call: Arc<AtomicU64>,
    name: String,
    timeout: Duration,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
        info!("Opened SQLite database {}", path.display());
        Ok(Self::from_connection(conn, name))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?, "main"))
    }

    pub fn from_connection(conn: Connection, name: impl Into<String>) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            active: Arc::new(Mutex::new(None)),
            next_call: Arc::new(AtomicU64::new(1)),
            name: name.into(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interrupt the running statement if it belongs to `call`. The owner
    /// slot is held across the interrupt so another call cannot start in
    /// between.
    fn interrupt_call(&self, call: u64) -> bool {
        match self.active.lock() {
            Ok(active) if *active == Some(call) => {
                self.interrupt.interrupt();
                true
            }
            _ => false,
        }
    }

    /// Run a setup script (DDL, fixtures). Not subject to any policy.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = lock(&conn).map_err(|e| Text2SqlError::Database(e.message))?;
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
        .map_err(|e| Text2SqlError::Database(format!("SQLite task failed: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> std::result::Result<std::sync::MutexGuard<'_, Connection>, ExecutionError> {
    conn.lock()
        .map_err(|_| ExecutionError::new(ExecutionErrorKind::Other, "SQLite connection lock poisoned"))
}

/// Map a rusqlite error onto an execution error kind. The message is kept
/// as the engine reported it.
pub fn classify_sqlite_error(err: &rusqlite::Error) -> ExecutionErrorKind {
    let message = err.to_string().to_lowercase();
    if let rusqlite::Error::SqliteFailure(failure, _) = err {
        match failure.code {
            ErrorCode::OperationInterrupted => return ExecutionErrorKind::Timeout,
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::AuthorizationForStatementDenied => {
                return ExecutionErrorKind::Permission
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => return ExecutionErrorKind::Connection,
            _ => {}
        }
    }
    if message.contains("syntax error") || message.contains("incomplete input") {
        ExecutionErrorKind::Syntax
    } else if message.contains("no such column")
        || message.contains("no such table")
        || message.contains("no such function")
        || message.contains("ambiguous column")
    {
        ExecutionErrorKind::UnknownObject
    } else if message.contains("interrupted") {
        ExecutionErrorKind::Timeout
    } else {
        ExecutionErrorKind::Other
    }
}

fn to_execution_error(err: rusqlite::Error) -> ExecutionError {
    ExecutionError::new(classify_sqlite_error(&err), err.to_string())
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

fn set_active(active: &Mutex<Option<u64>>, call: Option<u64>) {
    if let Ok(mut slot) = active.lock() {
        *slot = call;
    }
}

/// Marks a call cancelled when its future is dropped before the statement
/// ran, so the queued blocking task skips it.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn run_query(conn: &Connection, sql: &str) -> std::result::Result<QueryResult, ExecutionError> {
    let started = Instant::now();
    let mut stmt = conn.prepare(sql).map_err(to_execution_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query([]).map_err(to_execution_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(to_execution_error)? {
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(to_execution_error)?;
            record.insert(name.clone(), to_json(value));
        }
        out.push(record);
    }

    Ok(QueryResult::new(columns, out, started.elapsed().as_millis() as u64))
}

fn read_catalog(conn: &Connection, data_source: &str) -> rusqlite::Result<SchemaCatalog> {
    let mut tables_stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let table_names = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut columns_stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let mut fk_stmt = conn.prepare(r#"SELECT "table", "from", "to" FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#)?;

    let mut tables = Vec::new();
    let mut primary_keys = Vec::new();
    let mut foreign_keys = Vec::new();
    let mut unresolved = Vec::new();

    for table in &table_names {
        let mut columns = Vec::new();
        let mut rows = columns_stmt.query([table])?;
        while let Some(row) = rows.next()? {
            let column: String = row.get(0)?;
            let pk: i64 = row.get(1)?;
            if pk > 0 {
                primary_keys.push(PrimaryKey {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
            columns.push(column);
        }
        tables.push(SchemaEntry::new(table.clone(), columns));

        let mut rows = fk_stmt.query([table])?;
        while let Some(row) = rows.next()? {
            let referred_table: String = row.get(0)?;
            let column: String = row.get(1)?;
            // NULL "to" means the referred table's primary key
            match row.get::<_, Option<String>>(2)? {
                Some(referred_column) => foreign_keys.push(ForeignKey {
                    table: table.clone(),
                    column,
                    referred_table,
                    referred_column,
                }),
                None => unresolved.push((table.clone(), column, referred_table)),
            }
        }
    }

    for (table, column, referred_table) in unresolved {
        match primary_keys.iter().find(|pk| pk.table == referred_table) {
            Some(pk) => foreign_keys.push(ForeignKey {
                table,
                column,
                referred_column: pk.column.clone(),
                referred_table,
            }),
            None => warn!(
                "Foreign key {}.{} references {} which has no primary key",
                table, column, referred_table
            ),
        }
    }

    Ok(SchemaCatalog {
        data_source: data_source.to_string(),
        tables,
        foreign_keys,
        primary_keys,
    })
}

#[async_trait]
impl QueryExecutor for SqliteDatabase {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryResult, ExecutionError> {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel = CancelOnDrop(Arc::clone(&cancelled));
        let (started_tx, started_rx) = oneshot::channel();

        let conn = Arc::clone(&self.conn);
        let active = Arc::clone(&self.active);
        let owned_sql = sql.to_string();
        let mut task = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            if cancelled.load(Ordering::SeqCst) {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Timeout,
                    "query cancelled before it started",
                ));
            }
            set_active(&active, Some(call));
            let _ = started_tx.send(());
            let result = run_query(&conn, &owned_sql);
            set_active(&active, None);
            result
        });

        // Waiting for the lock is not part of the query budget.
        if started_rx.await.is_err() {
            debug!("SQLite call {} finished before starting a statement", call);
        }

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let interrupted = self.interrupt_call(call);
                warn!(
                    "SQLite query exceeded {:?}{}",
                    self.timeout,
                    if interrupted { ", interrupted" } else { "" }
                );
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Timeout,
                    format!("query exceeded {} ms", self.timeout.as_millis()),
                ));
            }
        };

        match joined {
            Ok(result) => {
                if let Ok(ref r) = result {
                    info!("SQLite returned {} rows in {} ms", r.row_count, r.execution_time_ms);
                }
                result
            }
            Err(join_error) => Err(ExecutionError::new(
                ExecutionErrorKind::Other,
                format!("SQLite task failed: {}", join_error),
            )),
        }
    }

    fn dialect(&self) -> &str {
        "SQLite"
    }
}

#[async_trait]
impl CatalogSource for SqliteDatabase {
    async fn fetch_catalog(&self, data_source: Option<&str>) -> Result<SchemaCatalog> {
        let conn = Arc::clone(&self.conn);
        let label = data_source.unwrap_or(self.name.as_str()).to_string();
        let catalog = tokio::task::spawn_blocking(move || -> Result<SchemaCatalog> {
            let conn = lock(&conn).map_err(|e| Text2SqlError::Catalog(e.message))?;
            read_catalog(&conn, &label).map_err(|e| Text2SqlError::Catalog(e.to_string()))
        })
        .await
        .map_err(|e| Text2SqlError::Catalog(format!("SQLite task failed: {}", e)))??;

        info!(
            "Fetched SQLite catalog '{}': {} tables, {} foreign keys",
            catalog.data_source,
            catalog.tables.len(),
            catalog.foreign_keys.len()
        );
        Ok(catalog)
    }
}
