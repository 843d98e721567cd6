//! HTTP providers against a mock server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use compliance_harness::config::{EmbeddingConfig, LlmConfig};
use compliance_harness::embed::{EmbedError, Embedder};
use compliance_harness::embedding::{OllamaProvider, OpenAIProvider};
use compliance_harness::llm::{GeminiProvider, OpenAiChatProvider};
use compliance_harness_core::embedding::EmbeddingProvider;
use compliance_harness_core::error::ProviderError;
use compliance_harness_core::llm::LlmProvider;
use compliance_harness_core::retry::RetryPolicy;

fn openai_embedder(server: &MockServer) -> OpenAIProvider {
    OpenAIProvider::with_endpoint(
        &server.uri(),
        Some("test-key".to_string()),
        "text-embedding-3-small".to_string(),
        3,
        16,
        Duration::from_secs(5),
    )
    .unwrap()
}

fn llm_config() -> LlmConfig {
    LlmConfig {
        model: "test-model".to_string(),
        timeout_secs: 5,
        ..Default::default()
    }
}

fn no_wait(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries, 0, 0, 5)
}

#[tokio::test]
async fn test_openai_embeddings_follow_index_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "text-embedding-3-small"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0, 0.0]},
                {"index": 0, "embedding": [1.0, 0.0, 0.0]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = openai_embedder(&server);
    let results = provider
        .embed_batch(&["first".to_string(), "second".to_string()])
        .await;

    assert_eq!(results[0].as_ref().unwrap(), &vec![1.0, 0.0, 0.0]);
    assert_eq!(results[1].as_ref().unwrap(), &vec![0.0, 1.0, 0.0]);
}

#[tokio::test]
async fn test_openai_wrong_dimensions_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [1.0, 0.0]}]
        })))
        .mount(&server)
        .await;

    let results = openai_embedder(&server)
        .embed_batch(&["only".to_string()])
        .await;
    assert!(matches!(results[0], Err(ProviderError::Permanent(_))));
}

#[tokio::test]
async fn test_rate_limit_is_retried_by_embedder() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.6, 0.8, 0.0]}]
        })))
        .mount(&server)
        .await;

    let embedder = Embedder::new(Arc::new(openai_embedder(&server)), no_wait(2), 16);
    let vectors = embedder
        .embed_all("doc-1", &["Cash reporting".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.6, 0.8, 0.0]]);
}

#[tokio::test]
async fn test_persistent_server_error_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let embedder = Embedder::new(Arc::new(openai_embedder(&server)), no_wait(2), 16);
    let err = embedder
        .embed_all("doc-1", &["Cash reporting".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, EmbedError::Exhausted { attempts: 3, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = Embedder::new(Arc::new(openai_embedder(&server)), no_wait(3), 16);
    let err = embedder
        .embed_all("doc-1", &["Cash reporting".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, EmbedError::Rejected { .. }));
}

#[tokio::test]
async fn test_ollama_embed_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"model": "nomic-embed-text"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3], [0.3, 0.2, 0.1]]
        })))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(&EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        dims: Some(3),
        url: Some(server.uri()),
        ..Default::default()
    })
    .unwrap();

    let results = provider
        .embed_batch(&["a".to_string(), "b".to_string()])
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].as_ref().unwrap(), &vec![0.3, 0.2, 0.1]);
    assert_eq!(provider.model().to_string(), "nomic-embed-text@3d");
}

#[tokio::test]
async fn test_chat_completion_returns_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "messages": [{"role": "system", "content": "be strict"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"status\": \"COMPLIANT\"}"}}]
        })))
        .mount(&server)
        .await;

    let provider = OpenAiChatProvider::with_endpoint(
        format!("{}/v1/chat/completions", server.uri()),
        None,
        &llm_config(),
    )
    .unwrap();
    let text = provider.generate("be strict", "question").await.unwrap();
    assert_eq!(text, "{\"status\": \"COMPLIANT\"}");
}

#[tokio::test]
async fn test_chat_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let provider = OpenAiChatProvider::with_endpoint(
        format!("{}/v1/chat/completions", server.uri()),
        None,
        &llm_config(),
    )
    .unwrap();
    let err = provider.generate("s", "u").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_gemini_sends_key_and_reads_first_candidate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/test-model:generateContent"))
        .and(query_param("key", "gemini-key"))
        .and(body_partial_json(json!({"generationConfig": {"maxOutputTokens": 2048}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "verdict text"}]}}]
        })))
        .mount(&server)
        .await;

    let provider = GeminiProvider::with_endpoint(
        format!("{}/v1beta/models/test-model:generateContent", server.uri()),
        "gemini-key".to_string(),
        &llm_config(),
    )
    .unwrap();
    let text = provider.generate("system", "user").await.unwrap();
    assert_eq!(text, "verdict text");
}
