//! OpenAI-compatible chat completions provider.

use crate::llm::provider::{Completion, GenerationRequest, LlmProvider, ProviderError};
use async_trait::async_trait;
use tracing::warn;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// The API accepts at most four stop sequences.
const MAX_STOP_SEQUENCES: usize = 4;

#[derive(Clone)]
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_key, base_url, model)
    }

    pub fn with_client(client: reqwest::Client, api_key: String, base_url: String, model: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({"role": "user", "content": request.prompt})];
        if let Some(seed) = &request.seed_prefix {
            messages.push(serde_json::json!({"role": "assistant", "content": seed}));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.stop_sequences.is_empty() {
            let stops: Vec<&String> = request.stop_sequences.iter().take(MAX_STOP_SEQUENCES).collect();
            body["stop"] = serde_json::json!(stops);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    async fn complete(&self, request: &GenerationRequest) -> Result<Completion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        if let Some(error) = response_json.get("error") {
            let message = error.to_string();
            return Err(if super::provider::is_throttling_message(&message) {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            });
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| ProviderError::Fatal(format!("No choices in LLM response: {}", response_json)))?;

        if choice.get("finish_reason").and_then(|r| r.as_str()) == Some("length") {
            warn!("LLM response was truncated at max_tokens");
        }

        let text = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Fatal(format!("No content in LLM response: {}", response_json)))?;

        let usage = &response_json["usage"];
        Ok(Completion {
            text: text.to_string(),
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        })
    }

    fn name(&self) -> String {
        format!("openai:{}", self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::DecodingParams;

    #[test]
    fn test_body_carries_seed_and_caps_stops() {
        let provider = OpenAiChatProvider::new("k".into(), "http://localhost/v1/".into(), "m".into());
        let request = GenerationRequest::new("prompt", DecodingParams::default())
            .with_stop_sequences(&["a", "b", "c", "d", "e"])
            .with_seed(Some("SQL: ```sql".into()));
        let body = provider.body(&request);

        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][1]["content"], "SQL: ```sql");
        assert_eq!(body["stop"].as_array().map(|s| s.len()), Some(4));
        assert!(body.get("top_p").is_none());
        assert_eq!(provider.base_url, "http://localhost/v1");
    }
}
