//! Schema Retriever
//!
//! Picks the tables a question is likely to need, from two sources:
//! semantic hits from the schema index, then lexical matches between
//! question tokens and table names.

use crate::catalog::SchemaCatalog;
use crate::retrieval::index::SemanticIndex;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const DEFAULT_TOP_K: usize = 4;

/// table name -> pipe-delimited column list.
///
/// Keys are unique. Backed by a sorted map so that rendering the same
/// mapping always produces the same prompt text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RetrievedSchema {
    tables: BTreeMap<String, String>,
}

impl RetrievedSchema {
    /// Add `table` unless it is already present. Returns whether it was added.
    pub fn insert_if_absent(&mut self, table: impl Into<String>, columns: impl Into<String>) -> bool {
        let table = table.into();
        if self.tables.contains_key(&table) {
            return false;
        }
        self.tables.insert(table, columns.into());
        true
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn columns(&self, table: &str) -> Option<&str> {
        self.tables.get(table).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.tables.iter()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaRetriever {
    top_k: usize,
}

impl Default for SchemaRetriever {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

impl SchemaRetriever {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Semantic hits first, then lexical matches for tables not yet present.
    ///
    /// An empty or failing index degrades to lexical-only. An empty result is
    /// returned as-is; deciding what that means is the caller's job.
    pub async fn retrieve(
        &self,
        question: &str,
        catalog: &SchemaCatalog,
        index: Option<&dyn SemanticIndex>,
    ) -> RetrievedSchema {
        let mut retrieved = RetrievedSchema::default();

        // Stage 1: semantic pass
        match index {
            Some(index) => {
                if index.is_empty().await {
                    warn!("Schema index is empty, using lexical retrieval only");
                } else {
                    match index.nearest(question, self.top_k).await {
                        Ok(hits) => {
                            for hit in hits {
                                let table = &hit.record.table_name;
                                let columns = catalog
                                    .table(table)
                                    .map(|entry| entry.pipe_columns())
                                    .unwrap_or_else(|| hit.record.schema.clone());
                                debug!(
                                    "Semantic hit {} (score {:.3}) via \"{}\"",
                                    table, hit.score, hit.record.question
                                );
                                retrieved.insert_if_absent(table.clone(), columns);
                            }
                        }
                        Err(e) => {
                            warn!("Schema index lookup failed, using lexical retrieval only: {}", e);
                        }
                    }
                }
            }
            None => debug!("No schema index configured, using lexical retrieval only"),
        }

        // Stage 2: lexical pass fills in what the index missed
        for table in lexical_matches(question, catalog) {
            if let Some(entry) = catalog.table(table) {
                retrieved.insert_if_absent(table, entry.pipe_columns());
            }
        }

        info!(
            "Retrieved {} table(s) for question: {:?}",
            retrieved.len(),
            retrieved.table_names()
        );
        retrieved
    }
}

/// Catalog table names mentioned in the question, first-seen order, no
/// duplicates. Tokens are whitespace-split, stripped of surrounding
/// punctuation and compared case-insensitively.
pub fn lexical_matches<'c>(question: &str, catalog: &'c SchemaCatalog) -> Vec<&'c str> {
    question
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|token| !token.is_empty())
        .filter_map(|token| catalog.find_table_ignore_case(token))
        .map(|entry| entry.table_name.as_str())
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaEntry;
    use crate::error::{Result, Text2SqlError};
    use crate::retrieval::index::{IndexHit, IndexRecord};
    use async_trait::async_trait;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new(
            "shop",
            vec![
                SchemaEntry::new("customers", vec!["customer_id".into(), "name".into()]),
                SchemaEntry::new("orders", vec!["order_id".into(), "customer_id".into()]),
                SchemaEntry::new("products", vec!["product_id".into(), "price".into()]),
            ],
        )
    }

    struct FixedIndex(Vec<IndexHit>);

    #[async_trait]
    impl SemanticIndex for FixedIndex {
        async fn nearest(&self, _text: &str, k: usize) -> Result<Vec<IndexHit>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }

        async fn len(&self) -> usize {
            self.0.len()
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl SemanticIndex for BrokenIndex {
        async fn nearest(&self, _text: &str, _k: usize) -> Result<Vec<IndexHit>> {
            Err(Text2SqlError::Index("embedding service down".into()))
        }

        async fn len(&self) -> usize {
            10
        }
    }

    fn hit(table: &str, schema: &str) -> IndexHit {
        IndexHit {
            record: IndexRecord {
                table_name: table.into(),
                question: format!("something about {}", table),
                schema: schema.into(),
            },
            score: 0.9,
        }
    }

    #[test]
    fn test_lexical_matches_order_and_dedup() {
        let catalog = catalog();
        let matches = lexical_matches("Orders per customers, and ORDERS again?", &catalog);
        assert_eq!(matches, vec!["orders", "customers"]);
    }

    #[tokio::test]
    async fn test_lexical_only_without_index() {
        let retrieved = SchemaRetriever::default()
            .retrieve("How many customers do we have?", &catalog(), None)
            .await;
        assert_eq!(retrieved.table_names(), vec!["customers"]);
        assert_eq!(retrieved.columns("customers"), Some("customer_id|name"));
    }

    #[tokio::test]
    async fn test_semantic_first_then_lexical_fill() {
        let index = FixedIndex(vec![hit("orders", "stale|schema"), hit("archive", "id|payload")]);
        let retrieved = SchemaRetriever::default()
            .retrieve("which customers placed orders", &catalog(), Some(&index))
            .await;

        assert_eq!(retrieved.len(), 3);
        // Catalog columns win over the stored schema for known tables
        assert_eq!(retrieved.columns("orders"), Some("order_id|customer_id"));
        // Unknown tables keep the schema stored in the index
        assert_eq!(retrieved.columns("archive"), Some("id|payload"));
        assert!(retrieved.contains("customers"));
    }

    #[tokio::test]
    async fn test_top_k_limits_semantic_hits() {
        let index = FixedIndex(vec![
            hit("customers", ""),
            hit("orders", ""),
            hit("products", ""),
        ]);
        let retrieved = SchemaRetriever::new(2)
            .retrieve("unrelated words", &catalog(), Some(&index))
            .await;
        assert_eq!(retrieved.table_names(), vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_broken_index_falls_back_to_lexical() {
        let retrieved = SchemaRetriever::default()
            .retrieve("list products", &catalog(), Some(&BrokenIndex))
            .await;
        assert_eq!(retrieved.table_names(), vec!["products"]);
    }

    #[tokio::test]
    async fn test_nothing_matched_is_empty() {
        let index = FixedIndex(vec![]);
        let retrieved = SchemaRetriever::default()
            .retrieve("what is the weather like", &catalog(), Some(&index))
            .await;
        assert!(retrieved.is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_is_idempotent() {
        let index = FixedIndex(vec![hit("products", "")]);
        let retriever = SchemaRetriever::default();
        let first = retriever.retrieve("customers and products", &catalog(), Some(&index)).await;
        let second = retriever.retrieve("customers and products", &catalog(), Some(&index)).await;
        assert_eq!(first, second);
    }
}
