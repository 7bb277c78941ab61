//! Provider seam
//!
//! A provider turns one [`GenerationRequest`] into one completion. It does
//! not retry and does not truncate; the generation client does both.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DecodingParams {
    pub temperature: f32,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub max_tokens: u32,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            top_p: None,
            max_tokens: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub stop_sequences: Vec<String>,
    /// Sent as the start of the assistant turn
    pub seed_prefix: Option<String>,
    pub params: DecodingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: DecodingParams) -> Self {
        Self {
            prompt: prompt.into(),
            stop_sequences: Vec::new(),
            seed_prefix: None,
            params,
        }
    }

    pub fn with_stop_sequences<S: AsRef<str>>(mut self, stops: &[S]) -> Self {
        self.stop_sequences = stops.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_seed(mut self, seed: Option<String>) -> Self {
        self.seed_prefix = seed.filter(|s| !s.is_empty());
        self
    }
}

/// Raw provider output: the continuation after the seed, plus token counts
/// when the provider reports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, overload, 5xx or a dropped connection; worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        let overloaded = status.as_u16() == 529;
        if status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
            || overloaded
            || is_throttling_message(body)
        {
            ProviderError::Transient(message)
        } else {
            ProviderError::Fatal(message)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Fatal(err.to_string())
        }
    }
}

pub fn is_throttling_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("throttl") || lower.contains("rate limit") || lower.contains("overloaded")
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<Completion, ProviderError>;

    /// Provider and model, for logs
    fn name(&self) -> String;
}
