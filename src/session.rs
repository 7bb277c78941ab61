//! Session
//!
//! Owns everything a run needs: the executor, the catalog snapshot, the
//! schema index, the prompt templates and the generation client. Nothing is
//! process-global; two sessions against different databases can coexist.

use crate::catalog::{CatalogSource, SchemaCatalog, StaticCatalog};
use crate::config::{DatabaseSettings, DatabaseTarget, EmbedderKind, LlmSettings, ProviderKind, Settings};
use crate::error::{Result, Text2SqlError};
use crate::executor::{PostgresDatabase, QueryExecutor, SqliteDatabase};
use crate::llm::{AnthropicMessagesProvider, GenerationClient, LlmProvider, OpenAiChatProvider, TokenSummary};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::prompt::{verify_stage_table, PromptComposer};
use crate::retrieval::{
    Embedder, HashingEmbedder, IndexHit, OpenAiEmbedder, SchemaIndex, SchemaRetriever, SeedQuestion,
    SemanticIndex, SharedSchemaIndex,
};
use crate::safety::StatementPolicy;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Session {
    settings: Settings,
    executor: Arc<dyn QueryExecutor>,
    catalog_source: Arc<dyn CatalogSource>,
    catalog: Arc<SchemaCatalog>,
    embedder: Arc<dyn Embedder>,
    index: Option<SharedSchemaIndex>,
    composer: Arc<PromptComposer>,
    client: Option<GenerationClient>,
}

impl Session {
    /// Connect using `settings`. A missing API key is not an error here:
    /// catalog and index commands work without one, only `pipeline()` needs it.
    pub async fn open(settings: Settings) -> Result<Self> {
        let client = match settings.llm.api_key() {
            Ok(key) => {
                let provider = build_provider(&settings.llm, key);
                Some(GenerationClient::new(provider, settings.retry.clone()))
            }
            Err(e) => {
                debug!("No generation client: {}", e);
                None
            }
        };
        Self::open_with_client(settings, client).await
    }

    /// Connect with a caller-supplied provider instead of the configured one.
    pub async fn with_provider(settings: Settings, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        let client = GenerationClient::new(provider, settings.retry.clone());
        Self::open_with_client(settings, Some(client)).await
    }

    async fn open_with_client(settings: Settings, client: Option<GenerationClient>) -> Result<Self> {
        settings.validate()?;

        let composer = match &settings.pipeline.template_dir {
            Some(dir) => PromptComposer::from_dir(dir)?,
            None => PromptComposer::default(),
        };
        verify_stage_table(&composer)?;

        let (executor, database_catalog) = connect(&settings.database).await?;
        let catalog_source: Arc<dyn CatalogSource> = match &settings.database.catalog_file {
            Some(path) => Arc::new(StaticCatalog::new(path)),
            None => database_catalog,
        };
        let catalog = catalog_source
            .fetch_catalog(settings.database.data_source.as_deref())
            .await?;
        if catalog.is_empty() {
            warn!("Catalog '{}' has no tables", catalog.data_source);
        }

        let embedder = build_embedder(&settings.llm)?;
        let index = match &settings.retrieval.index_path {
            Some(path) if path.is_file() => {
                Some(SharedSchemaIndex::new(SchemaIndex::load(path, Arc::clone(&embedder))?))
            }
            Some(path) => {
                warn!("Schema index {} does not exist yet, run `index build`", path.display());
                None
            }
            None => None,
        };

        info!(
            "Session ready: {} ({} tables, dialect {}, index {})",
            catalog.data_source,
            catalog.tables.len(),
            executor.dialect(),
            if index.is_some() { "loaded" } else { "none" }
        );

        Ok(Self {
            settings,
            executor,
            catalog_source,
            catalog: Arc::new(catalog),
            embedder,
            index,
            composer: Arc::new(composer),
            client,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn executor(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Re-read the catalog and swap the snapshot. Pipelines created earlier
    /// keep the snapshot they were built with.
    pub async fn refresh_catalog(&mut self) -> Result<()> {
        let catalog = self
            .catalog_source
            .fetch_catalog(self.settings.database.data_source.as_deref())
            .await?;
        info!(
            "Refreshed catalog '{}': {} -> {} tables",
            catalog.data_source,
            self.catalog.tables.len(),
            catalog.tables.len()
        );
        self.catalog = Arc::new(catalog);
        Ok(())
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        let client = self.client.clone().ok_or_else(|| {
            Text2SqlError::Config(format!("{} is not set", self.settings.llm.api_key_var()))
        })?;

        let options = PipelineOptions {
            stage_timeout: self.settings.pipeline.stage_timeout(),
            decoding: self.settings.llm.decoding.clone(),
            review_sql: self.settings.pipeline.review_generated_sql,
        };
        let mut pipeline = Pipeline::new(Arc::clone(&self.catalog), client, Arc::clone(&self.executor))
            .with_retriever(SchemaRetriever::new(self.settings.retrieval.top_k))
            .with_composer(Arc::clone(&self.composer))
            .with_policy(StatementPolicy::new(self.settings.pipeline.reject_unsafe_statements))
            .with_options(options);
        if let Some(index) = &self.index {
            pipeline = pipeline.with_index(Arc::new(index.clone()));
        }
        Ok(pipeline)
    }

    pub fn token_usage(&self) -> TokenSummary {
        self.client.as_ref().map(|c| c.usage()).unwrap_or_default()
    }

    /// Build the schema index from `seeds` (or one generated seed per table
    /// when empty), save it to the configured path and start using it.
    pub async fn build_index(&mut self, seeds: &[SeedQuestion]) -> Result<usize> {
        let generated;
        let seeds = if seeds.is_empty() {
            generated = default_seeds(&self.catalog);
            info!("No seed questions given, generated {} from the catalog", generated.len());
            &generated
        } else {
            seeds
        };

        let index = SchemaIndex::build(Arc::clone(&self.embedder), &self.catalog, seeds).await?;
        let records = index.len();
        if let Some(path) = &self.settings.retrieval.index_path {
            index.save(path)?;
            info!("Saved schema index to {}", path.display());
        }
        self.index = Some(SharedSchemaIndex::new(index));
        Ok(records)
    }

    pub async fn search_index(&self, text: &str, k: usize) -> Result<Vec<IndexHit>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| Text2SqlError::Index("no schema index loaded".to_string()))?;
        index.nearest(text, k).await
    }
}

/// Seed questions from a JSON array of `{"table": ..., "question": ...}`.
pub fn load_seeds(path: &Path) -> Result<Vec<SeedQuestion>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Text2SqlError::Index(format!("Failed to read seeds {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&text)?)
}

/// One seed per table built from its name and columns.
pub fn default_seeds(catalog: &SchemaCatalog) -> Vec<SeedQuestion> {
    catalog
        .tables
        .iter()
        .map(|entry| SeedQuestion {
            table: entry.table_name.clone(),
            question: format!(
                "{} {}",
                entry.table_name.replace('_', " "),
                entry.columns.join(" ").replace('_', " ")
            ),
        })
        .collect()
}

fn build_provider(llm: &LlmSettings, api_key: String) -> Arc<dyn LlmProvider> {
    match llm.provider {
        ProviderKind::Openai => Arc::new(OpenAiChatProvider::new(api_key, llm.base_url(), llm.model.clone())),
        ProviderKind::Anthropic => {
            Arc::new(AnthropicMessagesProvider::new(api_key, llm.base_url(), llm.model.clone()))
        }
    }
}

fn build_embedder(llm: &LlmSettings) -> Result<Arc<dyn Embedder>> {
    match llm.embedder {
        EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(llm.embedding_dimension))),
        EmbedderKind::Openai => Ok(Arc::new(OpenAiEmbedder::new(
            llm.api_key()?,
            llm.base_url(),
            llm.embedding_model.clone(),
            llm.embedding_dimension,
        ))),
    }
}

async fn connect(database: &DatabaseSettings) -> Result<(Arc<dyn QueryExecutor>, Arc<dyn CatalogSource>)> {
    match database.target()? {
        DatabaseTarget::Postgres(url) => {
            let db = Arc::new(
                PostgresDatabase::connect(&url, database.max_connections, database.query_timeout()).await?,
            );
            let executor: Arc<dyn QueryExecutor> = db.clone();
            let source: Arc<dyn CatalogSource> = db;
            Ok((executor, source))
        }
        target => {
            let db = match target {
                DatabaseTarget::Sqlite(path) => SqliteDatabase::open(&path)?,
                _ => SqliteDatabase::open_in_memory()?,
            };
            let db = Arc::new(db.with_timeout(database.query_timeout()));
            let executor: Arc<dyn QueryExecutor> = db.clone();
            let source: Arc<dyn CatalogSource> = db;
            Ok((executor, source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, GenerationRequest, ProviderError};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use tempfile::TempDir;

    struct CannedProvider;

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn complete(&self, _request: &GenerationRequest) -> std::result::Result<Completion, ProviderError> {
            Ok(Completion::default())
        }

        fn name(&self) -> String {
            "canned".to_string()
        }
    }

    fn shop_settings(dir: &TempDir) -> Settings {
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), total REAL);",
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.database.url = Some(path.display().to_string());
        settings.retrieval.index_path = Some(dir.path().join("index.json"));
        settings
    }

    #[tokio::test]
    async fn test_open_reads_catalog_without_api_key() {
        let dir = TempDir::new().unwrap();
        let session = Session::open(shop_settings(&dir)).await.unwrap();

        let catalog = session.catalog();
        assert_eq!(catalog.data_source, "shop");
        assert_eq!(catalog.table_names().collect::<Vec<_>>(), vec!["customers", "orders"]);
        assert!(!session.has_index());
        assert!(matches!(session.pipeline(), Err(Text2SqlError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_index_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let settings = shop_settings(&dir);

        let mut session = Session::with_provider(settings.clone(), Arc::new(CannedProvider))
            .await
            .unwrap();
        let records = session
            .build_index(&[SeedQuestion {
                table: "orders".to_string(),
                question: "What was the biggest order total?".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(records, 1);
        assert!(session.pipeline().is_ok());

        let reopened = Session::with_provider(settings, Arc::new(CannedProvider)).await.unwrap();
        assert!(reopened.has_index());
        let hits = reopened.search_index("biggest order total", 1).await.unwrap();
        assert_eq!(hits[0].record.table_name, "orders");
    }

    #[tokio::test]
    async fn test_generated_seeds_cover_every_table() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::open(shop_settings(&dir)).await.unwrap();
        assert_eq!(session.build_index(&[]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_catalog_sees_new_tables() {
        let dir = TempDir::new().unwrap();
        let settings = shop_settings(&dir);
        let mut session = Session::open(settings.clone()).await.unwrap();

        let path = dir.path().join("shop.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE refunds (id INTEGER PRIMARY KEY, order_id INTEGER)")
            .unwrap();

        assert!(session.catalog().table("refunds").is_none());
        session.refresh_catalog().await.unwrap();
        assert!(session.catalog().table("refunds").is_some());
    }

    #[tokio::test]
    async fn test_search_without_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut settings = shop_settings(&dir);
        settings.retrieval.index_path = None;
        let session = Session::open(settings).await.unwrap();
        assert!(matches!(
            session.search_index("customers", 3).await,
            Err(Text2SqlError::Index(_))
        ));
    }
}
