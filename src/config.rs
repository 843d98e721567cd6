//! TOML configuration.
//!
//! Loaded once at startup by [`load_config`] and validated before any
//! command runs. API keys are never read from the file; providers pick
//! them up from `OPENAI_API_KEY` / `GEMINI_API_KEY`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use compliance_harness_core::chunk::ChunkParams;
use compliance_harness_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_sentence_lookback")]
    pub sentence_lookback: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            sentence_lookback: default_sentence_lookback(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
            sentence_lookback: self.sentence_lookback,
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap() -> usize {
    50
}
fn default_sentence_lookback() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_embed_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_embed_base_delay_ms(),
            max_delay_ms: default_embed_max_delay_ms(),
            timeout_secs: default_embed_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.base_delay_ms,
            self.max_delay_ms,
            self.timeout_secs,
        )
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_base_delay_ms() -> u64 {
    500
}
fn default_embed_max_delay_ms() -> u64 {
    8000
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_widen_factor")]
    pub widen_factor: usize,
    /// Upper bound on one index search, including the model binding read.
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            widen_factor: default_widen_factor(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f64 {
    0.25
}
fn default_widen_factor() -> usize {
    2
}
fn default_retrieval_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Full endpoint URL override. Empty means the provider default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_llm_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_max_retries(),
            base_delay_ms: default_llm_base_delay_ms(),
            max_delay_ms: default_llm_max_delay_ms(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.base_delay_ms,
            self.max_delay_ms,
            self.timeout_secs,
        )
    }

    /// Configured URL with empty strings treated as unset.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_output_tokens() -> u32 {
    2048
}
fn default_llm_base_delay_ms() -> u64 {
    1000
}
fn default_llm_max_delay_ms() -> u64 {
    10_000
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DecisionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_scope")]
    pub default_scope: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            default_scope: default_scope(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.9
}
fn default_scope() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.widen_factor < 1 {
        anyhow::bail!("retrieval.widen_factor must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }
    if config.retrieval.timeout_ms == 0 {
        anyhow::bail!("retrieval.timeout_ms must be > 0");
    }

    // Validate decision
    if !(0.0..=1.0).contains(&config.decision.confidence_threshold) {
        anyhow::bail!("decision.confidence_threshold must be in [0.0, 1.0]");
    }
    if config.decision.default_scope.trim().is_empty() {
        anyhow::bail!("decision.default_scope must not be empty");
    }

    // Validate embedding
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"./data/chk.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.max_tokens, 400);
        assert_eq!(cfg.chunking.overlap_tokens, 50);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.retrieval.min_similarity, 0.25);
        assert_eq!(cfg.retrieval.timeout_ms, 10_000);
        assert_eq!(cfg.decision.confidence_threshold, 0.9);
        assert_eq!(cfg.server.bind, "127.0.0.1:7341");
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.llm.retry_policy().attempts(), 4);
    }

    #[test]
    fn test_overlap_must_be_below_max() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[chunking]\nmax_tokens = 50\noverlap_tokens = 50\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse_config("[db]\npath = \"x\"\n[llm]\nprovider = \"bard\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn test_threshold_range() {
        assert!(
            parse_config("[db]\npath = \"x\"\n[decision]\nconfidence_threshold = 1.5\n").is_err()
        );
    }

    #[test]
    fn test_retrieval_timeout_must_be_positive() {
        let err = parse_config("[db]\npath = \"x\"\n[retrieval]\ntimeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_empty_llm_url_is_unset() {
        let cfg = parse_config("[db]\npath = \"x\"\n[llm]\nurl = \"\"\n").unwrap();
        assert!(cfg.llm.url().is_none());
    }
}
