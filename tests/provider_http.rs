//! Provider wire format and retry behavior against a mock HTTP server.

use serde_json::json;
use std::sync::Arc;
use text2sql::extract::OutputTag;
use text2sql::llm::{
    AnthropicMessagesProvider, DecodingParams, GenerationClient, GenerationRequest, OpenAiChatProvider,
};
use text2sql::retry::RetryPolicy;
use text2sql::Text2SqlError;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_reply(content: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 120, "completion_tokens": 12}
    })
}

fn easy_request() -> GenerationRequest {
    GenerationRequest::new("Q: \"How many customers are there?\"", DecodingParams::default())
        .with_stop_sequences(&["</example>", "<example>"])
        .with_seed(Some("SQL: ```sql".to_string()))
}

fn openai_client(server: &MockServer, retry: RetryPolicy) -> GenerationClient {
    let provider = OpenAiChatProvider::new("sk-test".into(), format!("{}/v1", server.uri()), "gpt-test".into());
    GenerationClient::new(Arc::new(provider), retry)
}

#[tokio::test]
async fn test_openai_continuation_is_appended_to_seed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_reply("\nSELECT COUNT(*) FROM customers\n```\n</example>ignored")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = openai_client(&server, RetryPolicy::immediate(3));
    let result = client
        .generate_tagged(&easy_request(), OutputTag::Fence("sql"))
        .await
        .unwrap();

    assert_eq!(result.raw_text, "SQL: ```sql\nSELECT COUNT(*) FROM customers\n```\n");
    assert_eq!(result.extracted_tag_value.as_deref(), Some("SELECT COUNT(*) FROM customers"));
    assert_eq!(client.usage().input_tokens, 120);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["model"], "gpt-test");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "SQL: ```sql");
    assert_eq!(body["stop"], json!(["</example>", "<example>"]));
    assert_eq!(body["temperature"], 0.0);
}

#[tokio::test]
async fn test_throttling_is_retried_with_the_same_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit reached"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("\nSELECT 1\n```")))
        .mount(&server)
        .await;

    let client = openai_client(&server, RetryPolicy::immediate(5));
    let result = client.generate(&easy_request()).await.unwrap();
    assert!(result.raw_text.ends_with("SELECT 1\n```"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests.windows(2).all(|pair| pair[0].body == pair[1].body));
    assert_eq!(client.usage().calls, 1);
}

#[tokio::test]
async fn test_persistent_throttling_exhausts_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .expect(3)
        .mount(&server)
        .await;

    let client = openai_client(&server, RetryPolicy::immediate(3));
    let err = client.generate(&easy_request()).await.unwrap_err();

    match err {
        Text2SqlError::GenerationTransient { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("503"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = openai_client(&server, RetryPolicy::immediate(10));
    let err = client.generate(&easy_request()).await.unwrap_err();
    assert!(matches!(err, Text2SqlError::Llm(ref m) if m.contains("401")));
}

#[tokio::test]
async fn test_anthropic_messages_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "content": [
                {"type": "text", "text": " The customers table holds them.\n"},
                {"type": "text", "text": "<links>[customers]</links>"}
            ],
            "usage": {"input_tokens": 300, "output_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicMessagesProvider::new("sk-ant-test".into(), server.uri(), "claude-test".into());
    let client = GenerationClient::new(Arc::new(provider), RetryPolicy::immediate(2));
    let request = GenerationRequest::new("schema linking prompt", DecodingParams::default())
        .with_stop_sequences(&["</example>"])
        .with_seed(Some("A: Let's think step by step. ".to_string()));

    let result = client.generate_tagged(&request, OutputTag::Xml("links")).await.unwrap();
    assert_eq!(result.extracted_tag_value.as_deref(), Some("[customers]"));
    assert_eq!(client.usage().output_tokens, 15);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["messages"][1]["role"], "assistant");
    assert_eq!(body["messages"][1]["content"], "A: Let's think step by step.");
    assert_eq!(body["stop_sequences"], json!(["</example>"]));
}

#[tokio::test]
async fn test_anthropic_overloaded_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .expect(2)
        .mount(&server)
        .await;

    let provider = AnthropicMessagesProvider::new("k".into(), server.uri(), "claude-test".into());
    let client = GenerationClient::new(Arc::new(provider), RetryPolicy::immediate(2));
    let err = client
        .generate(&GenerationRequest::new("prompt", DecodingParams::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Text2SqlError::GenerationTransient { attempts: 2, .. }));
}
