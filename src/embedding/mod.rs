//! Embedding provider implementations.
//!
//! Concrete backends for the core [`EmbeddingProvider`] trait:
//! - **[`DisabledProvider`]** — fails every item; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** — `POST /v1/embeddings` on OpenAI or a compatible gateway.
//! - **[`OllamaProvider`]** — `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`** — in-process inference via fastembed
//!   (feature `local-embeddings-fastembed`).
//!
//! Providers make exactly one request per [`embed_batch`](EmbeddingProvider::embed_batch)
//! call and never retry on their own; [`crate::embed::Embedder`] owns
//! batching, retry, and backoff.
//!
//! # Error Classification
//!
//! - HTTP 429 and 5xx → [`ProviderError::Transient`]
//! - other HTTP 4xx → [`ProviderError::Permanent`]
//! - network errors → transient; client-side timeouts → [`ProviderError::Timeout`]
//! - items missing from an otherwise valid response → transient, so only
//!   those items are retried
//! - vectors of the wrong length → permanent

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use compliance_harness_core::embedding::EmbeddingProvider;
use compliance_harness_core::error::ProviderError;

use crate::config::EmbeddingConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Same error for every input of a failed call.
fn fail_all(n: usize, err: ProviderError) -> Vec<Result<Vec<f32>, ProviderError>> {
    vec![Err(err); n]
}

/// Map a reqwest send error onto the provider taxonomy.
pub(crate) fn classify_send_error(e: &reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout.as_millis() as u64)
    } else {
        ProviderError::Transient(e.to_string())
    }
}

/// Map a non-success HTTP status onto the provider taxonomy.
pub(crate) fn classify_status(
    service: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> ProviderError {
    let msg = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(msg)
    } else {
        ProviderError::Permanent(msg)
    }
}

/// Place parsed vectors into input order, checking dimensionality.
///
/// `indexed` pairs each vector with the input position it answers.
fn collect_vectors(
    n: usize,
    dims: usize,
    indexed: Vec<(usize, Vec<f32>)>,
) -> Vec<Result<Vec<f32>, ProviderError>> {
    let mut out: Vec<Result<Vec<f32>, ProviderError>> = (0..n)
        .map(|i| {
            Err(ProviderError::Transient(format!(
                "no embedding returned for input {}",
                i
            )))
        })
        .collect();
    for (i, v) in indexed {
        if i >= n {
            continue;
        }
        out[i] = if v.len() == dims {
            Ok(v)
        } else {
            Err(ProviderError::Permanent(format!(
                "embedding has {} dimensions, expected {}",
                v.len(),
                dims
            )))
        };
    }
    out
}

fn json_to_vec(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
        fail_all(
            texts.len(),
            ProviderError::Permanent("embedding provider is disabled".to_string()),
        )
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI embeddings API.
pub struct OpenAIProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    batch_size: usize,
    timeout: Duration,
}

impl OpenAIProvider {
    /// Create a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set, or if
    /// `OPENAI_API_KEY` is missing while no custom `url` is configured.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        let base = config.url.as_deref().unwrap_or(OPENAI_BASE_URL);
        Self::with_endpoint(
            base,
            api_key,
            model,
            dims,
            config.batch_size,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Create a provider against an explicit base URL.
    pub fn with_endpoint(
        base_url: &str,
        api_key: Option<String>,
        model: String,
        dims: usize,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dims,
            batch_size: batch_size.max(1),
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => return fail_all(texts.len(), classify_send_error(&e, self.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return fail_all(texts.len(), classify_status("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = match response.json().await {
            Ok(j) => j,
            Err(e) => {
                return fail_all(
                    texts.len(),
                    ProviderError::Permanent(format!("Invalid OpenAI response: {}", e)),
                )
            }
        };

        match parse_openai_response(&json) {
            Ok(indexed) => collect_vectors(texts.len(), self.dims, indexed),
            Err(e) => fail_all(texts.len(), e),
        }
    }
}

/// Extract `data[].embedding`, keyed by `data[].index` (position when absent).
fn parse_openai_response(
    json: &serde_json::Value,
) -> Result<Vec<(usize, Vec<f32>)>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing data array".to_string())
        })?;

    let mut out = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec = item.get("embedding").and_then(json_to_vec).ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing embedding".to_string())
        })?;
        out.push((index, vec));
    }
    Ok(out)
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_BASE_URL.to_string());
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            batch_size: config.batch_size.max(1),
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = match self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let err = match classify_send_error(&e, self.timeout) {
                    ProviderError::Transient(_) => ProviderError::Transient(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    )),
                    other => other,
                };
                return fail_all(texts.len(), err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return fail_all(texts.len(), classify_status("Ollama", status, &body_text));
        }

        let json: serde_json::Value = match response.json().await {
            Ok(j) => j,
            Err(e) => {
                return fail_all(
                    texts.len(),
                    ProviderError::Permanent(format!("Invalid Ollama response: {}", e)),
                )
            }
        };

        match json.get("embeddings").and_then(|e| e.as_array()) {
            Some(list) => {
                let indexed = list
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| json_to_vec(v).map(|vec| (i, vec)))
                    .collect();
                collect_vectors(texts.len(), self.dims, indexed)
            }
            None => fail_all(
                texts.len(),
                ProviderError::Permanent(
                    "Invalid Ollama response: missing embeddings array".to_string(),
                ),
            ),
        }
    }
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use super::*;
    use std::sync::Mutex;

    /// In-process embedding via fastembed. Models are downloaded from
    /// Hugging Face on first use and cached; afterwards no network is needed.
    pub struct LocalProvider {
        model_name: String,
        dims: usize,
        batch_size: usize,
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalProvider {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            // Validate the name up front
            config_to_fastembed_model(&model_name)?;
            let dims = config.dims.unwrap_or(match model_name.as_str() {
                "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => 768,
                "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
                _ => 384,
            });
            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size.max(1),
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
                 multilingual-e5-large",
                other
            ),
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalProvider {
        fn model_name(&self) -> &str {
            &self.model_name
        }
        fn dims(&self) -> usize {
            self.dims
        }
        fn max_batch(&self) -> usize {
            self.batch_size
        }

        async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
            let n = texts.len();
            let dims = self.dims;
            let batch_size = self.batch_size;
            let name = self.model_name.clone();
            let slot = self.model.clone();
            let texts = texts.to_vec();

            let joined = tokio::task::spawn_blocking(move || {
                let mut guard = slot
                    .lock()
                    .map_err(|_| ProviderError::Permanent("local model lock poisoned".into()))?;
                let model = match guard.as_mut() {
                    Some(m) => m,
                    None => {
                        let kind = config_to_fastembed_model(&name)
                            .map_err(|e| ProviderError::Permanent(e.to_string()))?;
                        let m = fastembed::TextEmbedding::try_new(
                            fastembed::InitOptions::new(kind).with_show_download_progress(false),
                        )
                        .map_err(|e| {
                            ProviderError::Permanent(format!(
                                "Failed to initialize local embedding model: {}",
                                e
                            ))
                        })?;
                        guard.insert(m)
                    }
                };
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| ProviderError::Transient(format!("Local embedding failed: {}", e)))
            })
            .await;

            match joined {
                Ok(Ok(vectors)) => collect_vectors(n, dims, vectors.into_iter().enumerate().collect()),
                Ok(Err(e)) => fail_all(n, e),
                Err(e) => fail_all(n, ProviderError::Permanent(e.to_string())),
            }
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalProvider;

/// Create the [`EmbeddingProvider`] named by the configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
