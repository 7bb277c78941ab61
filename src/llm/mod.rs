//! LLM access: the provider seam, two HTTP providers and the generation
//! client the pipeline talks to.

pub mod anthropic;
pub mod client;
pub mod openai;
pub mod provider;

pub use anthropic::{AnthropicMessagesProvider, DEFAULT_ANTHROPIC_BASE_URL};
pub use client::{truncate_at_stop, GenerationClient, GenerationResult, TokenSummary, TokenUsage};
pub use openai::{OpenAiChatProvider, DEFAULT_OPENAI_BASE_URL};
pub use provider::{Completion, DecodingParams, GenerationRequest, LlmProvider, ProviderError};
