//! Schema Index
//!
//! Precomputed (table, representative question, schema) records searched by
//! embedding similarity. The shared handle enforces a single writer: readers
//! run concurrently, and an insert only holds the write lock for the push,
//! never across the embedding call.

use crate::catalog::SchemaCatalog;
use crate::error::{Result, Text2SqlError};
use crate::retrieval::embedder::Embedder;
use crate::retrieval::vector_store::InMemoryVectorStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub table_name: String,
    pub question: String,
    /// Pipe-delimited column list
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub record: IndexRecord,
    pub score: f32,
}

/// Seed entry used to build an index: a question known to need `table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedQuestion {
    pub table: String,
    pub question: String,
}

/// "Given text, return the nearest K stored items with similarity scores."
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn nearest(&self, text: &str, k: usize) -> Result<Vec<IndexHit>>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct SchemaIndex {
    store: InMemoryVectorStore<IndexRecord>,
    embedder: Arc<dyn Embedder>,
}

impl SchemaIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store: InMemoryVectorStore::new(embedder.dimension()),
            embedder,
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn records(&self) -> impl Iterator<Item = &IndexRecord> {
        self.store.items()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub async fn add(&mut self, record: IndexRecord) -> Result<()> {
        let embedding = self.embedder.embed(&record.question).await?;
        self.store.add(record, embedding)
    }

    pub async fn search(&self, text: &str, k: usize) -> Result<Vec<IndexHit>> {
        let query = self.embedder.embed(text).await?;
        Ok(self
            .store
            .search(&query, k)?
            .into_iter()
            .map(|r| IndexHit {
                record: r.item,
                score: r.score,
            })
            .collect())
    }

    /// Build from seed questions; schemas come from the catalog. Seeds naming
    /// tables the catalog does not know are skipped.
    pub async fn build(
        embedder: Arc<dyn Embedder>,
        catalog: &SchemaCatalog,
        seeds: &[SeedQuestion],
    ) -> Result<Self> {
        let mut index = Self::new(embedder);
        for seed in seeds {
            let Some(entry) = catalog.find_table_ignore_case(&seed.table) else {
                warn!("Seed question references unknown table '{}', skipping", seed.table);
                continue;
            };
            index
                .add(IndexRecord {
                    table_name: entry.table_name.clone(),
                    question: seed.question.clone(),
                    schema: entry.pipe_columns(),
                })
                .await?;
        }
        info!(
            "Built schema index with {} records using {}",
            index.len(),
            index.embedder.name()
        );
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }

    pub fn load(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let store = InMemoryVectorStore::load(path)?;
        if store.dimension() != embedder.dimension() {
            return Err(Text2SqlError::Index(format!(
                "Index {} has dimension {}, embedder {} produces {}",
                path.display(),
                store.dimension(),
                embedder.name(),
                embedder.dimension()
            )));
        }
        info!("Loaded schema index {} ({} records)", path.display(), store.len());
        Ok(Self { store, embedder })
    }

    fn push_embedded(&mut self, record: IndexRecord, embedding: Vec<f32>) -> Result<()> {
        self.store.add(record, embedding)
    }
}

/// Session-wide handle to a schema index.
#[derive(Clone)]
pub struct SharedSchemaIndex {
    inner: Arc<RwLock<SchemaIndex>>,
}

impl SharedSchemaIndex {
    pub fn new(index: SchemaIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(index)),
        }
    }

    /// Add a record. Embedding happens before the write lock is taken.
    pub async fn insert(&self, record: IndexRecord) -> Result<()> {
        let embedder = self.inner.read().await.embedder();
        let embedding = embedder.embed(&record.question).await?;
        self.inner.write().await.push_embedded(record, embedding)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.inner.read().await.save(path)
    }
}

#[async_trait]
impl SemanticIndex for SharedSchemaIndex {
    async fn nearest(&self, text: &str, k: usize) -> Result<Vec<IndexHit>> {
        let embedder = self.inner.read().await.embedder();
        let query = embedder.embed(text).await?;
        let guard = self.inner.read().await;
        Ok(guard
            .store
            .search(&query, k)?
            .into_iter()
            .map(|r| IndexHit {
                record: r.item,
                score: r.score,
            })
            .collect())
    }

    async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl SemanticIndex for SchemaIndex {
    async fn nearest(&self, text: &str, k: usize) -> Result<Vec<IndexHit>> {
        self.search(text, k).await
    }

    async fn len(&self) -> usize {
        self.store.len()
    }
}
