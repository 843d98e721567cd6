//! LLM provider implementations.
//!
//! - [`OpenAiChatProvider`] — any OpenAI-compatible `chat/completions` endpoint.
//! - [`GeminiProvider`] — Google Gemini `generateContent`.
//! - [`DisabledLlm`] — rejects every call; `chk search` still works with it.
//!
//! Providers issue one request per [`generate`](LlmProvider::generate) call.
//! Retry, backoff, and the per-attempt timeout are applied by the engine
//! through [`crate::retry::with_retry`]. Status codes are classified the
//! same way as for embeddings: 429 and 5xx are transient, other 4xx are not.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use compliance_harness_core::error::ProviderError;
use compliance_harness_core::llm::LlmProvider;

use crate::config::LlmConfig;
use crate::embedding::{classify_send_error, classify_status};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// --- OpenAI-compatible request and response structures ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessage,
}

/// Chat-completions provider for OpenAI or a compatible local server.
#[derive(Clone, Debug)]
pub struct OpenAiChatProvider {
    client: ReqwestClient,
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiChatProvider {
    /// Create a provider from configuration.
    ///
    /// The key comes from `OPENAI_API_KEY`. It may be absent only when a
    /// custom `url` points at a server that does not need one.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url().is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Self::with_endpoint(
            config.url().unwrap_or(OPENAI_CHAT_URL).to_string(),
            api_key,
            config,
        )
    }

    pub fn with_endpoint(
        api_url: String,
        api_key: Option<String>,
        config: &LlmConfig,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = ReqwestClient::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            timeout,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let request_body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut request_builder = self.client.post(&self.api_url);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.bearer_auth(key);
        }

        let response = request_builder
            .json(&request_body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status("LLM", status, &error_text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Invalid LLM response: {}", e)))?;

        Ok(chat
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

// --- Gemini-specific request and response structures ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize, Debug)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: ContentResponse,
}

#[derive(Deserialize, Debug)]
struct ContentResponse {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Deserialize, Debug)]
struct PartResponse {
    text: String,
}

/// Provider for the Google Gemini API.
#[derive(Clone, Debug)]
pub struct GeminiProvider {
    client: ReqwestClient,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl GeminiProvider {
    /// Create a provider from configuration; the key comes from `GEMINI_API_KEY`.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let api_url = match config.url() {
            Some(url) => url.to_string(),
            None => format!("{}/{}:generateContent", GEMINI_BASE_URL, config.model),
        };
        Self::with_endpoint(api_url, api_key, config)
    }

    pub fn with_endpoint(api_url: String, api_key: String, config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = ReqwestClient::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            timeout,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let request_body = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: format!("{}\n\n{}", system, user),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        };

        let response = self
            .client
            .post(&self.api_url)
            .query(&[("key", &self.api_key)])
            .json(&request_body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status("Gemini", status, &error_text));
        }

        let gemini: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Invalid Gemini response: {}", e)))?;

        Ok(gemini
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default())
    }
}

/// Rejects every call.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _system: &str, _user: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Permanent("llm provider is disabled".to_string()))
    }
}

/// Create the [`LlmProvider`] named by `[llm].provider`.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAiChatProvider::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
