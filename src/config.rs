//! Settings
//!
//! Loaded in three layers: an optional TOML file, then environment
//! variables (a `.env` file is read by the binary), then CLI flags applied
//! by the caller. Every section has defaults, so an empty file is valid.

use crate::error::{Result, Text2SqlError};
use crate::llm::{DecodingParams, DEFAULT_ANTHROPIC_BASE_URL, DEFAULT_OPENAI_BASE_URL};
use crate::retrieval::DEFAULT_TOP_K;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    Openai,
    Anthropic,
}

impl FromStr for ProviderKind {
    type Err = Text2SqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::Openai),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => Err(Text2SqlError::Config(format!(
                "unknown LLM provider '{}' (expected openai or anthropic)",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedderKind {
    /// Offline feature-hashing embedder
    #[default]
    Hashing,
    Openai,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub embedder: EmbedderKind,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub decoding: DecodingParams,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            embedder: EmbedderKind::Hashing,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 256,
            decoding: DecodingParams::default(),
        }
    }
}

impl LlmSettings {
    pub fn base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| match self.provider {
            ProviderKind::Openai => DEFAULT_OPENAI_BASE_URL.to_string(),
            ProviderKind::Anthropic => DEFAULT_ANTHROPIC_BASE_URL.to_string(),
        })
    }

    /// Environment variable holding the key for the configured provider.
    pub fn api_key_var(&self) -> &'static str {
        match self.provider {
            ProviderKind::Openai => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Text2SqlError::Config(format!("{} is not set", self.api_key_var())))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// Saved schema index (JSON)
    pub index_path: Option<PathBuf>,
    /// Seed questions used by `index build`
    pub seed_questions: Option<PathBuf>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            index_path: None,
            seed_questions: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct DatabaseSettings {
    /// `sqlite://path`, a `.db`/`.sqlite` path, or `postgres://...`
    pub url: Option<String>,
    /// Schema (PostgreSQL) or catalog label
    pub data_source: Option<String>,
    /// Static JSON catalog used instead of reading the database metadata
    pub catalog_file: Option<PathBuf>,
    pub max_connections: u32,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            data_source: None,
            catalog_file: None,
            max_connections: 10,
            query_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Sqlite(PathBuf),
    SqliteMemory,
    Postgres(String),
}

impl DatabaseSettings {
    pub fn target(&self) -> Result<DatabaseTarget> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Text2SqlError::Config("DATABASE_URL is not set".to_string()))?;

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(DatabaseTarget::Postgres(url.to_string()));
        }
        let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"));
        match path {
            Some(":memory:") => Ok(DatabaseTarget::SqliteMemory),
            Some(path) => Ok(DatabaseTarget::Sqlite(PathBuf::from(path))),
            None if url.ends_with(".db") || url.ends_with(".sqlite") || url.ends_with(".sqlite3") => {
                Ok(DatabaseTarget::Sqlite(PathBuf::from(url)))
            }
            None => Err(Text2SqlError::Config(format!("unsupported database URL '{}'", url))),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineSettings {
    pub stage_timeout_secs: u64,
    pub reject_unsafe_statements: bool,
    /// One review call over generated SQL before it first runs
    pub review_generated_sql: bool,
    /// Directory with `<template>.txt` overrides
    pub template_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 300,
            reject_unsafe_statements: true,
            review_generated_sql: true,
            template_dir: None,
        }
    }
}

impl PipelineSettings {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub retry: RetryPolicy,
    pub retrieval: RetrievalSettings,
    pub database: DatabaseSettings,
    pub pipeline: PipelineSettings,
}

impl Settings {
    /// File (if given), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Text2SqlError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let settings = Self::from_toml(&text)
            .map_err(|e| Text2SqlError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Text2SqlError::Config(e.to_string()))
    }

    /// Apply environment overrides through `lookup`, so tests need not touch
    /// the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(base_url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }
        if let Some(key) = lookup(self.llm.api_key_var()) {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(source) = lookup("TEXT2SQL_DATA_SOURCE") {
            self.database.data_source = Some(source);
        }
        if let Some(index) = lookup("TEXT2SQL_INDEX") {
            self.retrieval.index_path = Some(PathBuf::from(index));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.retrieval.top_k == 0 {
            problems.push("retrieval.top-k must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max-attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            problems.push("retry.jitter must be between 0 and 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            problems.push("retry.backoff-multiplier must be at least 1");
        }
        if self.pipeline.stage_timeout_secs == 0 {
            problems.push("pipeline.stage-timeout-secs must be positive");
        }
        if self.database.query_timeout_secs == 0 {
            problems.push("database.query-timeout-secs must be positive");
        }
        if self.llm.embedding_dimension == 0 {
            problems.push("llm.embedding-dimension must be positive");
        }
        if self.llm.decoding.max_tokens == 0 {
            problems.push("llm.decoding.max-tokens must be positive");
        }
        // The HTTP embedder shares the chat provider's key and base URL
        if self.llm.embedder == EmbedderKind::Openai && self.llm.provider != ProviderKind::Openai {
            problems.push("llm.embedder = \"openai\" requires llm.provider = \"openai\"");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Text2SqlError::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.retry.max_attempts, 100);
        assert!(settings.pipeline.reject_unsafe_statements);
        assert!(settings.pipeline.review_generated_sql);
    }

    #[test]
    fn test_kebab_case_sections() {
        let settings = Settings::from_toml(
            r#"
            [llm]
            provider = "anthropic"
            model = "claude-test"

            [llm.decoding]
            max-tokens = 1024
            top-k = 200

            [retry]
            max-attempts = 7

            [pipeline]
            stage-timeout-secs = 45
            reject-unsafe-statements = false
            review-generated-sql = false
            "#,
        )
        .unwrap();
        assert_eq!(settings.llm.provider, ProviderKind::Anthropic);
        assert_eq!(settings.llm.decoding.max_tokens, 1024);
        assert_eq!(settings.llm.decoding.top_k, Some(200));
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.pipeline.stage_timeout(), Duration::from_secs(45));
        assert!(!settings.pipeline.reject_unsafe_statements);
        assert!(!settings.pipeline.review_generated_sql);
        assert_eq!(settings.llm.base_url(), DEFAULT_ANTHROPIC_BASE_URL);
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("LLM_PROVIDER", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("DATABASE_URL", "sqlite://shop.db"),
            ("TEXT2SQL_INDEX", "index.json"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::from_toml("[llm]\nmodel = \"from-file\"").unwrap();
        settings
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.llm.model, "from-file");
        assert_eq!(settings.llm.api_key().unwrap(), "sk-ant");
        assert_eq!(settings.database.target().unwrap(), DatabaseTarget::Sqlite("shop.db".into()));
        assert_eq!(settings.retrieval.index_path, Some(PathBuf::from("index.json")));
    }

    #[test]
    fn test_validation_collects_problems() {
        let mut settings = Settings::default();
        settings.retrieval.top_k = 0;
        settings.retry.jitter = 2.0;
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("top-k"));
        assert!(err.contains("jitter"));
    }

    #[test]
    fn test_database_targets() {
        let db = |url: &str| DatabaseSettings {
            url: Some(url.to_string()),
            ..DatabaseSettings::default()
        };
        assert_eq!(
            db("postgres://u:p@localhost/shop").target().unwrap(),
            DatabaseTarget::Postgres("postgres://u:p@localhost/shop".into())
        );
        assert_eq!(db("sqlite::memory:").target().unwrap(), DatabaseTarget::SqliteMemory);
        assert_eq!(db("data/shop.sqlite").target().unwrap(), DatabaseTarget::Sqlite("data/shop.sqlite".into()));
        assert!(db("mysql://localhost").target().is_err());
        assert!(DatabaseSettings::default().target().is_err());
    }

    #[test]
    fn test_missing_api_key_names_variable() {
        let err = LlmSettings::default().api_key().unwrap_err().to_string();
        assert!(err.contains("OPENAI_API_KEY"));
    }
}
