//! Shared fixtures for the integration tests.
//!
//! - [`HashEmbedder`]: deterministic bag-of-words vectors, no network.
//! - [`ScriptedLlm`]: replays queued responses and records every prompt.
//! - [`TestHarness`]: a migrated SQLite database in a temp dir wired into a
//!   [`Harness`] with the two providers above.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use compliance_harness::app::Harness;
use compliance_harness::config::{parse_config, Config};
use compliance_harness::{db, migrate};
use compliance_harness_core::embedding::EmbeddingProvider;
use compliance_harness_core::error::ProviderError;
use compliance_harness_core::llm::LlmProvider;
use compliance_harness_core::models::{Document, DocumentClass};

pub const HASH_DIMS: usize = 1024;

/// Counts of lowercase alphanumeric words hashed into a fixed number of
/// buckets, L2-normalized.
pub struct HashEmbedder {
    model: &'static str,
    failure: Option<ProviderError>,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::named("mock-hash")
    }

    pub fn named(model: &'static str) -> Self {
        Self {
            model,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A provider whose every call fails permanently.
    pub fn broken() -> Self {
        Self::new().failing(ProviderError::Permanent("model not found".to_string()))
    }

    /// Fail every call with `err`.
    pub fn failing(mut self, err: ProviderError) -> Self {
        self.failure = Some(err);
        self
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; HASH_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % HASH_DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        self.model
    }

    fn dims(&self) -> usize {
        HASH_DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|t| match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(hash_embed(t)),
            })
            .collect()
    }
}

/// Replays queued responses in order. An empty queue answers with a
/// permanent error.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, body: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(body.into()));
    }

    pub fn push_err(&self, err: ProviderError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// `(system, user)` of every call so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Permanent("no scripted response".into())))
    }
}

pub struct TestHarness {
    pub harness: Harness,
    pub llm: Arc<ScriptedLlm>,
    pub db_path: PathBuf,
    _dir: TempDir,
}

/// Config with zero backoff so retry paths run instantly.
pub fn test_config(db_path: &std::path::Path, extra: &str) -> Config {
    let toml = format!(
        r#"
[db]
path = "{}"

[embedding]
provider = "disabled"
base_delay_ms = 0
max_delay_ms = 0

[llm]
max_retries = 2
base_delay_ms = 0
max_delay_ms = 0
timeout_secs = 5

{}
"#,
        db_path.display(),
        extra
    );
    parse_config(&toml).unwrap()
}

/// Bag-of-words similarity tops out well below real embeddings, so the
/// default fixture lowers the threshold to keep the retrieval cap out of
/// the way.
pub const DEFAULT_DECISION: &str = "[decision]\nconfidence_threshold = 0.5\n";

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(HashEmbedder::new(), DEFAULT_DECISION).await
    }

    pub async fn with_config(extra: &str) -> Self {
        Self::build(HashEmbedder::new(), extra).await
    }

    pub async fn build(embedder: HashEmbedder, extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("chk.sqlite");
        let config = test_config(&db_path, extra);

        let pool = db::connect_path(&db_path).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();

        let llm = ScriptedLlm::new();
        let harness = Harness::with_providers(
            config,
            compliance_harness::sqlite_store::SqliteStore::new(pool),
            Arc::new(embedder),
            llm.clone(),
        );

        Self {
            harness,
            llm,
            db_path,
            _dir: dir,
        }
    }

    /// A second harness over the same database with a different embedder.
    pub async fn sibling(&self, embedder: Arc<HashEmbedder>) -> (Harness, Arc<ScriptedLlm>) {
        let pool = db::connect_path(&self.db_path).await.unwrap();
        let llm = ScriptedLlm::new();
        let harness = Harness::with_providers(
            (*self.harness.config).clone(),
            compliance_harness::sqlite_store::SqliteStore::new(pool),
            embedder,
            llm.clone(),
        );
        (harness, llm)
    }

    pub async fn ingest(&self, id: &str, name: &str, class: DocumentClass, text: &str) -> usize {
        self.harness
            .ingestor
            .ingest(Document::new(id, name, class, None), text)
            .await
            .unwrap()
            .chunk_count
    }
}

pub const CBN_CIRCULAR: &str = "Section 4.2 Cash Transaction Reporting. Banks must report \
every cash transaction above the reporting threshold of 50,000 to the regulator.";

pub const AML_POLICY: &str = "Clause 7 Cash Transaction Reporting. Branches report cash \
transactions above the internal reporting threshold of 100,000 to compliance.";

pub const THRESHOLD_QUERY: &str = "What is the cash transaction reporting threshold?";

/// A well-formed model answer citing `documents`.
pub fn verdict_json(status: &str, confidence: f64, documents: &[&str]) -> String {
    let analysis: Vec<_> = documents
        .iter()
        .map(|d| {
            json!({
                "point": format!("{} sets a cash reporting threshold.", d),
                "clause_reference": "4.2",
                "document_name": d,
            })
        })
        .collect();
    json!({
        "status": status,
        "confidence_score": confidence,
        "summary": "Cash transactions above the regulator threshold must be reported.",
        "analysis": analysis,
        "violations": [{
            "what": "Internal threshold is higher than the regulator threshold",
            "why": "Transactions between 50,000 and 100,000 go unreported",
            "clause": "7",
            "document_name": documents.last().copied().unwrap_or("none"),
        }],
        "recommendations": [
            {"recommendation": "Review annually", "priority": "low"},
            {"recommendation": "Lower the internal threshold to 50,000", "priority": "high"}
        ]
    })
    .to_string()
}
