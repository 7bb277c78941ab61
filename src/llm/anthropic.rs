//! Anthropic messages API provider.

use crate::llm::provider::{is_throttling_message, Completion, GenerationRequest, LlmProvider, ProviderError};
use async_trait::async_trait;

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicMessagesProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicMessagesProvider {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({"role": "user", "content": request.prompt})];
        if let Some(seed) = &request.seed_prefix {
            // Prefill may not end in whitespace
            messages.push(serde_json::json!({"role": "assistant", "content": seed.trim_end()}));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        if let Some(top_k) = request.params.top_k {
            body["top_k"] = serde_json::json!(top_k);
        }
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop_sequences);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for AnthropicMessagesProvider {
    async fn complete(&self, request: &GenerationRequest) -> Result<Completion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status, &error_text));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("Failed to parse LLM response: {}", e)))?;

        if response_json["type"] == "error" {
            let message = response_json["error"].to_string();
            return Err(if is_throttling_message(&message) {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            });
        }

        let blocks = response_json["content"]
            .as_array()
            .ok_or_else(|| ProviderError::Fatal(format!("No content in LLM response: {}", response_json)))?;
        let text: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();

        let usage = &response_json["usage"];
        Ok(Completion {
            text,
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        })
    }

    fn name(&self) -> String {
        format!("anthropic:{}", self.model)
    }
}
