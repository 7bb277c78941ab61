//! Schema Catalog
//!
//! Normalized table/column metadata for one data source, plus the renderers
//! that turn it into the text blocks the prompt templates embed.

use crate::error::{Result, Text2SqlError};
use crate::retrieval::RetrievedSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One table and its columns in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub table_name: String,
    pub columns: Vec<String>,
}

impl SchemaEntry {
    pub fn new(table_name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
        }
    }

    /// `a|b|c`
    pub fn pipe_columns(&self) -> String {
        self.columns.join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub referred_table: String,
    pub referred_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub table: String,
    pub column: String,
}

/// Metadata snapshot for a data source. Immutable once fetched; sessions
/// replace the whole snapshot when refreshing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub data_source: String,
    pub tables: Vec<SchemaEntry>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub primary_keys: Vec<PrimaryKey>,
}

impl SchemaCatalog {
    pub fn new(data_source: impl Into<String>, tables: Vec<SchemaEntry>) -> Self {
        Self {
            data_source: data_source.into(),
            tables,
            foreign_keys: Vec::new(),
            primary_keys: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&SchemaEntry> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    /// Case-insensitive lookup, returning the catalog spelling.
    pub fn find_table_ignore_case(&self, name: &str) -> Option<&SchemaEntry> {
        self.tables
            .iter()
            .find(|t| t.table_name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.table_name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// One `Table t, columns = [a,b]` line per table.
    ///
    /// When `scope` is given, only the retrieved tables are rendered, with the
    /// retrieved column list.
    pub fn render_fields(&self, scope: Option<&RetrievedSchema>) -> String {
        let mut output = String::new();
        match scope {
            Some(retrieved) => {
                for (table, columns) in retrieved.iter() {
                    let cols: Vec<&str> = columns.split('|').filter(|c| !c.is_empty()).collect();
                    output.push_str(&format!("Table {}, columns = [{}]\n", table, cols.join(",")));
                }
            }
            None => {
                for entry in &self.tables {
                    output.push_str(&format!(
                        "Table {}, columns = [{}]\n",
                        entry.table_name,
                        entry.columns.join(",")
                    ));
                }
            }
        }
        if output.is_empty() {
            "[]".to_string()
        } else {
            output
        }
    }

    /// `[a.x = b.y,c.z = d.w]`, or `[]` when there are none in scope.
    pub fn render_foreign_keys(&self, scope: Option<&RetrievedSchema>) -> String {
        let keys: Vec<String> = self
            .foreign_keys
            .iter()
            .filter(|fk| match scope {
                Some(retrieved) => {
                    retrieved.contains(&fk.table) && retrieved.contains(&fk.referred_table)
                }
                None => true,
            })
            .map(|fk| {
                format!(
                    "{}.{} = {}.{}",
                    fk.table, fk.column, fk.referred_table, fk.referred_column
                )
            })
            .collect();
        format!("[{}]", keys.join(","))
    }

    /// `[a.id,b.id]`, or `[]`.
    pub fn render_primary_keys(&self, scope: Option<&RetrievedSchema>) -> String {
        let keys: Vec<String> = self
            .primary_keys
            .iter()
            .filter(|pk| scope.map(|r| r.contains(&pk.table)).unwrap_or(true))
            .map(|pk| format!("{}.{}", pk.table, pk.column))
            .collect();
        format!("[{}]", keys.join(","))
    }
}

/// Source of catalog metadata (a live database or a static file).
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch metadata for `data_source`. `None` means the source's default
    /// namespace.
    async fn fetch_catalog(&self, data_source: Option<&str>) -> Result<SchemaCatalog>;
}

/// Catalog read from a JSON file, for offline runs.
pub struct StaticCatalog {
    path: PathBuf,
}

impl StaticCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(path: &Path) -> Result<SchemaCatalog> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Text2SqlError::Catalog(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        let catalog: SchemaCatalog = serde_json::from_str(&text)?;
        Ok(catalog)
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch_catalog(&self, data_source: Option<&str>) -> Result<SchemaCatalog> {
        let mut catalog = Self::load(&self.path)?;
        if let Some(name) = data_source {
            if catalog.data_source != name {
                return Err(Text2SqlError::Catalog(format!(
                    "Catalog file {} describes '{}', not '{}'",
                    self.path.display(),
                    catalog.data_source,
                    name
                )));
            }
            catalog.data_source = name.to_string();
        }
        info!(
            "Loaded static catalog '{}' with {} tables",
            catalog.data_source,
            catalog.tables.len()
        );
        Ok(catalog)
    }
}
