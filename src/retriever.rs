//! The Retriever: embed a query once, then search and assemble evidence.
//!
//! The index's model binding is checked before the query is embedded, so a
//! query against an index built with another model fails without spending
//! the embedding retry budget. Index reads are bounded by
//! `[retrieval].timeout_ms`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use compliance_harness_core::error::IndexError;
use compliance_harness_core::models::EvidenceItem;
use compliance_harness_core::retrieve::{retrieve, RetrieveParams};
use compliance_harness_core::store::{check_model, ScopeFilter, VectorIndex};

use crate::config::RetrievalConfig;
use crate::embed::{EmbedError, Embedder};

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error(transparent)]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("index search timed out after {0}ms")]
    Timeout(u64),
}

#[derive(Clone)]
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Embedder,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Embedder, config: RetrievalConfig) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// `[retrieval].top_k`, used when a request does not name its own.
    pub fn default_top_k(&self) -> usize {
        self.config.top_k
    }

    /// Ranked evidence for `query`, restricted to `filter`.
    ///
    /// `top_k` falls back to `[retrieval].top_k`. An empty result means no
    /// chunk reached `min_similarity`.
    pub async fn retrieve(
        &self,
        query_id: &str,
        query: &str,
        top_k: Option<usize>,
        filter: ScopeFilter,
    ) -> Result<Vec<EvidenceItem>, RetrieveError> {
        let model = self.embedder.model();
        let indexed = self.bounded(self.index.indexed_model()).await?;
        check_model(indexed.as_ref(), &model, model.dims).inspect_err(|e| {
            warn!(query_id, error = %e, "query rejected by index configuration");
        })?;

        let vector = self.embedder.embed_query(query_id, query).await?;
        let params = RetrieveParams {
            top_k: top_k.unwrap_or(self.config.top_k),
            min_similarity: self.config.min_similarity,
            widen_factor: self.config.widen_factor,
            filter,
        };

        let evidence = self
            .bounded(retrieve(self.index.as_ref(), &model, &vector, &params))
            .await
            .inspect_err(|e| {
                if matches!(e, RetrieveError::Index(e) if e.is_configuration()) {
                    warn!(query_id, error = %e, "query rejected by index configuration");
                }
            })?;

        debug!(
            query_id,
            evidence = evidence.len(),
            top_k = params.top_k,
            "retrieval complete"
        );
        Ok(evidence)
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, RetrieveError>
    where
        F: Future<Output = Result<T, IndexError>>,
    {
        let limit = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(limit, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RetrieveError::Timeout(self.config.timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use compliance_harness_core::embedding::EmbeddingProvider;
    use compliance_harness_core::error::ProviderError;
    use compliance_harness_core::models::{DocumentClass, EmbeddingModel};
    use compliance_harness_core::retry::RetryPolicy;
    use compliance_harness_core::store::memory::InMemoryIndex;
    use compliance_harness_core::store::{ChunkMetadata, IndexEntry, ScoredChunk};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn model_name(&self) -> &str {
            self.name
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            texts.iter().map(|_| Ok(vec![1.0, 0.0])).collect()
        }
    }

    /// Delegates to an in-memory index after sleeping in every search.
    struct Slow {
        inner: InMemoryIndex,
        delay: Duration,
    }

    #[async_trait]
    impl VectorIndex for Slow {
        async fn indexed_model(&self) -> Result<Option<EmbeddingModel>, IndexError> {
            self.inner.indexed_model().await
        }
        async fn upsert(&self, model: &EmbeddingModel, entry: IndexEntry) -> Result<(), IndexError> {
            self.inner.upsert(model, entry).await
        }
        async fn replace_document(
            &self,
            model: &EmbeddingModel,
            document_id: &str,
            entries: Vec<IndexEntry>,
        ) -> Result<(), IndexError> {
            self.inner.replace_document(model, document_id, entries).await
        }
        async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, IndexError> {
            self.inner.delete_chunk(chunk_id).await
        }
        async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
            self.inner.delete_document(document_id).await
        }
        async fn search(
            &self,
            model: &EmbeddingModel,
            query: &[f32],
            k: usize,
            filter: &ScopeFilter,
        ) -> Result<Vec<ScoredChunk>, IndexError> {
            tokio::time::sleep(self.delay).await;
            self.inner.search(model, query, k, filter).await
        }
    }

    async fn seeded(model: &EmbeddingModel) -> InMemoryIndex {
        let index = InMemoryIndex::with_model(model.clone());
        index
            .upsert(
                model,
                IndexEntry {
                    chunk_id: "c1".into(),
                    vector: vec![1.0, 0.0],
                    metadata: ChunkMetadata {
                        document_id: "cbn".into(),
                        chunk_index: 0,
                        section_label: None,
                        clause_number: None,
                        page_number: None,
                        document_name: "CBN-Circular-2024".into(),
                        document_class: DocumentClass::RegulatorCircular,
                        knowledgebase_id: None,
                        text: "Report cash above 50,000.".into(),
                    },
                },
            )
            .await
            .unwrap();
        index
    }

    fn embedder(provider: Arc<Fixed>) -> Embedder {
        Embedder::new(provider, RetryPolicy::new(3, 0, 0, 5), 8)
    }

    fn config(timeout_ms: u64) -> RetrievalConfig {
        RetrievalConfig {
            timeout_ms,
            ..RetrievalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_slow_search_times_out() {
        let provider = Fixed::new("fixed");
        let model = provider.model();
        let index = Slow {
            inner: seeded(&model).await,
            delay: Duration::from_millis(500),
        };
        let retriever = Retriever::new(Arc::new(index), embedder(provider), config(20));

        let err = retriever
            .retrieve("q1", "cash threshold", None, ScopeFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrieveError::Timeout(20)));
    }

    #[tokio::test]
    async fn test_search_within_limit_returns_evidence() {
        let provider = Fixed::new("fixed");
        let model = provider.model();
        let index = Slow {
            inner: seeded(&model).await,
            delay: Duration::from_millis(1),
        };
        let retriever = Retriever::new(Arc::new(index), embedder(provider), config(5_000));

        let evidence = retriever
            .retrieve("q1", "cash threshold", None, ScopeFilter::default())
            .await
            .unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].document_name, "CBN-Circular-2024");
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected_before_embedding() {
        let indexed = EmbeddingModel::new("fixed", 2);
        let provider = Fixed::new("other-model");
        let retriever = Retriever::new(
            Arc::new(seeded(&indexed).await),
            embedder(provider.clone()),
            config(5_000),
        );

        let err = retriever
            .retrieve("q1", "cash threshold", None, ScopeFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrieveError::Index(IndexError::ModelMismatch { .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
