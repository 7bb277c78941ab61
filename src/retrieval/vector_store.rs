//! Vector Store
//!
//! In-memory cosine-similarity store. Linear scan; the catalogs this crate
//! indexes hold hundreds of records, not millions.

use crate::error::{Result, Text2SqlError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// Stored item with its embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVector<T> {
    pub item: T,
    pub embedding: Embedding,
}

/// Search result from vector store
#[derive(Debug, Clone)]
pub struct SearchResult<T> {
    pub item: T,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryVectorStore<T> {
    dimension: usize,
    entries: Vec<StoredVector<T>>,
}

impl<T> InMemoryVectorStore<T>
where
    T: Clone + Serialize + for<'de> Deserialize<'de>,
{
    /// Create a new vector store with specified embedding dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Add an item. Embeddings of the wrong dimension are rejected.
    pub fn add(&mut self, item: T, embedding: Embedding) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(Text2SqlError::Index(format!(
                "Embedding dimension {} doesn't match store dimension {}",
                embedding.len(),
                self.dimension
            )));
        }
        self.entries.push(StoredVector { item, embedding });
        Ok(())
    }

    /// Top-k items by cosine similarity, best first. Ties keep insertion
    /// order so repeated searches are stable.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult<T>>> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        if query.len() != self.dimension {
            return Err(Text2SqlError::Index(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query.len(),
                self.dimension
            )));
        }

        let mut results: Vec<SearchResult<T>> = self
            .entries
            .iter()
            .map(|entry| SearchResult {
                item: entry.item.clone(),
                score: cosine_similarity(query, &entry.embedding),
            })
            .collect();

        // Stable sort: equal scores stay in insertion order
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);

        Ok(results)
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save the store, embeddings included, as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = serde_json::to_string(self)?;
        std::fs::write(path, encoded).map_err(|e| {
            Text2SqlError::Index(format!("Failed to write vector store {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let encoded = std::fs::read_to_string(path).map_err(|e| {
            Text2SqlError::Index(format!("Failed to read vector store {}: {}", path.display(), e))
        })?;
        let store: Self = serde_json::from_str(&encoded)?;
        if let Some(bad) = store.entries.iter().find(|e| e.embedding.len() != store.dimension) {
            return Err(Text2SqlError::Index(format!(
                "Stored embedding of dimension {} in a store of dimension {}",
                bad.embedding.len(),
                store.dimension
            )));
        }
        Ok(store)
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 1.0);

        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_search_orders_by_score() {
        let mut store = InMemoryVectorStore::new(2);
        store.add("east".to_string(), vec![1.0, 0.0]).unwrap();
        store.add("north".to_string(), vec![0.0, 1.0]).unwrap();
        store.add("north-east".to_string(), vec![0.7, 0.7]).unwrap();

        let results = store.search(&[0.1, 1.0], 2).unwrap();
        let names: Vec<_> = results.iter().map(|r| r.item.as_str()).collect();
        assert_eq!(names, vec!["north", "north-east"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut store: InMemoryVectorStore<String> = InMemoryVectorStore::new(3);
        assert!(store.add("x".into(), vec![1.0]).is_err());
        store.add("y".into(), vec![1.0, 0.0, 0.0]).unwrap();
        assert!(store.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_empty_store_search() {
        let store: InMemoryVectorStore<String> = InMemoryVectorStore::new(3);
        assert!(store.search(&[1.0, 0.0, 0.0], 4).unwrap().is_empty());
    }
}
