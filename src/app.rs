//! Wiring of stores, providers, and services from configuration.

use std::sync::Arc;

use anyhow::Result;

use compliance_harness_core::embedding::EmbeddingProvider;
use compliance_harness_core::llm::LlmProvider;

use crate::config::Config;
use crate::corrections::CorrectionService;
use crate::db;
use crate::embed::Embedder;
use crate::embedding::create_provider;
use crate::engine::DecisionEngine;
use crate::ingest::Ingestor;
use crate::llm::{create_llm, DisabledLlm};
use crate::retriever::Retriever;
use crate::sqlite_store::SqliteStore;

/// Every service the CLI and HTTP server need, sharing one store.
#[derive(Clone)]
pub struct Harness {
    pub config: Arc<Config>,
    pub store: SqliteStore,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
    pub engine: DecisionEngine,
    pub corrections: CorrectionService,
}

impl Harness {
    /// Connect to the configured database and build providers from config.
    ///
    /// The schema must already exist (`chk init`).
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let embedding = create_provider(&config.embedding)?;
        let llm = create_llm(&config.llm)?;
        Ok(Self::with_providers(
            config.clone(),
            SqliteStore::new(pool),
            embedding,
            llm,
        ))
    }

    /// Like [`open`](Self::open) with the model disabled, for commands that
    /// never generate a verdict.
    pub async fn open_without_llm(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let embedding = create_provider(&config.embedding)?;
        Ok(Self::with_providers(
            config.clone(),
            SqliteStore::new(pool),
            embedding,
            Arc::new(DisabledLlm),
        ))
    }

    /// Build from explicit providers. Used by tests and embedders of the library.
    pub fn with_providers(
        config: Config,
        store: SqliteStore,
        embedding: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let embedder = Embedder::new(
            embedding,
            config.embedding.retry_policy(),
            config.embedding.batch_size,
        );
        let shared = Arc::new(store.clone());

        let ingestor = Ingestor::new(store.clone(), embedder.clone(), config.chunking.params());
        let retriever = Retriever::new(shared.clone(), embedder, config.retrieval.clone());
        let engine = DecisionEngine::new(
            retriever.clone(),
            llm,
            shared.clone(),
            shared.clone(),
            config.llm.retry_policy(),
            config.decision.confidence_threshold,
            config.decision.default_scope.clone(),
        );
        let corrections = CorrectionService::new(shared);

        Self {
            config: Arc::new(config),
            store,
            ingestor,
            retriever,
            engine,
            corrections,
        }
    }
}
