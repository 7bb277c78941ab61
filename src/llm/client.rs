//! Generation Client
//!
//! Wraps a provider with the retry policy, stop-sequence truncation, seed
//! prefixing and token accounting.

use crate::error::{Result, Text2SqlError};
use crate::extract::{Extractor, OutputTag};
use crate::llm::provider::{GenerationRequest, LlmProvider, ProviderError};
use crate::retry::{RetryError, RetryPolicy};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Seed prefix followed by the truncated continuation
    pub raw_text: String,
    /// Last non-empty occurrence of the requested tag, if one was requested
    pub extracted_tag_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Cumulative token counters, shared by every pipeline run in a session.
#[derive(Debug, Default)]
pub struct TokenUsage {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    calls: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.input_tokens.store(0, Ordering::Relaxed);
        self.output_tokens.store(0, Ordering::Relaxed);
        self.calls.store(0, Ordering::Relaxed);
    }
}

/// Cut `text` at the earliest occurrence of any stop sequence. The stop
/// sequence itself is not kept.
pub fn truncate_at_stop<'a, S: AsRef<str>>(text: &'a str, stop_sequences: &[S]) -> &'a str {
    let cut = stop_sequences
        .iter()
        .map(AsRef::as_ref)
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop))
        .min()
        .unwrap_or(text.len());
    &text[..cut]
}

#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    usage: Arc<TokenUsage>,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            usage: Arc::new(TokenUsage::default()),
        }
    }

    pub fn provider_name(&self) -> String {
        self.provider.name()
    }

    pub fn usage(&self) -> TokenSummary {
        self.usage.summary()
    }

    pub fn reset_usage(&self) {
        self.usage.reset()
    }

    /// Send `request`, retrying transient faults with the identical request.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let provider = &self.provider;
        debug!("Prompt for {}:\n{}", provider.name(), request.prompt);

        let outcome = self
            .retry
            .run(
                move |attempt| {
                    debug!("Generation attempt {} via {}", attempt, provider.name());
                    provider.complete(request)
                },
                ProviderError::is_transient,
            )
            .await;

        let completion = match outcome {
            Ok(completion) => completion,
            Err(RetryError::Fatal(e)) => return Err(Text2SqlError::Llm(e.to_string())),
            Err(RetryError::Exhausted { attempts, last_error }) => {
                return Err(Text2SqlError::GenerationTransient {
                    attempts,
                    last_error: last_error.to_string(),
                })
            }
        };

        self.usage.record(completion.input_tokens, completion.output_tokens);
        let continuation = truncate_at_stop(&completion.text, &request.stop_sequences);
        let raw_text = match &request.seed_prefix {
            Some(seed) => format!("{}{}", seed, continuation),
            None => continuation.to_string(),
        };
        info!(
            "Generated {} chars ({} in / {} out tokens)",
            raw_text.len(),
            completion.input_tokens,
            completion.output_tokens
        );
        debug!("Raw output:\n{}", raw_text);

        Ok(GenerationResult {
            raw_text,
            extracted_tag_value: None,
        })
    }

    /// Like [`generate`](Self::generate), also pulling out the last non-empty
    /// `tag` in the output. A missing tag is not an error here.
    pub async fn generate_tagged(&self, request: &GenerationRequest, tag: OutputTag) -> Result<GenerationResult> {
        let mut result = self.generate(request).await?;
        result.extracted_tag_value = Extractor::new(tag)
            .require_last(&result.raw_text)
            .ok()
            .map(|m| m.content.to_string());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{Completion, DecodingParams};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails with the queued errors, then answers with `text`.
    struct FlakyProvider {
        failures: Mutex<Vec<ProviderError>>,
        text: String,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl FlakyProvider {
        fn new(failures: Vec<ProviderError>, text: &str) -> Self {
            Self {
                failures: Mutex::new(failures),
                text: text.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn complete(&self, request: &GenerationRequest) -> std::result::Result<Completion, ProviderError> {
            self.seen.lock().unwrap().push(request.clone());
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(Completion {
                text: self.text.clone(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }

        fn name(&self) -> String {
            "flaky".into()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("prompt", DecodingParams::default())
            .with_stop_sequences(&["</example>", "<example>"])
            .with_seed(Some("SQL: ```sql".into()))
    }

    #[test]
    fn test_truncate_at_earliest_stop() {
        assert_eq!(truncate_at_stop("abc<example>x</example>", &["</example>", "<example>"]), "abc");
        assert_eq!(truncate_at_stop("no stops here", &["</example>"]), "no stops here");
        assert_eq!(truncate_at_stop("keep", &[""]), "keep");
    }

    #[tokio::test]
    async fn test_seed_is_prefixed_and_stop_removed() {
        let provider = Arc::new(FlakyProvider::new(
            vec![],
            "\nSELECT COUNT(*) FROM customers\n```\n</example>\n<example>more",
        ));
        let client = GenerationClient::new(provider, RetryPolicy::immediate(3));
        let result = client
            .generate_tagged(&request(), OutputTag::Fence("sql"))
            .await
            .unwrap();

        assert_eq!(result.raw_text, "SQL: ```sql\nSELECT COUNT(*) FROM customers\n```\n");
        assert_eq!(
            result.extracted_tag_value.as_deref(),
            Some("SELECT COUNT(*) FROM customers")
        );
    }

    #[tokio::test]
    async fn test_transient_faults_resend_identical_request() {
        let provider = Arc::new(FlakyProvider::new(
            vec![
                ProviderError::Transient("429".into()),
                ProviderError::Transient("throttled".into()),
            ],
            " ok```",
        ));
        let client = GenerationClient::new(provider.clone(), RetryPolicy::immediate(5));
        client.generate(&request()).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| *r == request()));
        assert_eq!(client.usage().calls, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let failures = (0..3).map(|_| ProviderError::Transient("503".into())).collect();
        let provider = Arc::new(FlakyProvider::new(failures, "unused"));
        let client = GenerationClient::new(provider, RetryPolicy::immediate(3));

        match client.generate(&request()).await {
            Err(Text2SqlError::GenerationTransient { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected GenerationTransient, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let provider = Arc::new(FlakyProvider::new(vec![ProviderError::Fatal("401".into())], "unused"));
        let client = GenerationClient::new(provider.clone(), RetryPolicy::immediate(5));
        assert!(matches!(client.generate(&request()).await, Err(Text2SqlError::Llm(_))));
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_usage_accumulates_and_resets() {
        let provider = Arc::new(FlakyProvider::new(vec![], "x"));
        let client = GenerationClient::new(provider, RetryPolicy::immediate(1));
        client.generate(&request()).await.unwrap();
        client.generate(&request()).await.unwrap();
        assert_eq!(
            client.usage(),
            TokenSummary {
                input_tokens: 20,
                output_tokens: 10,
                calls: 2
            }
        );
        client.reset_usage();
        assert_eq!(client.usage(), TokenSummary::default());
    }
}
