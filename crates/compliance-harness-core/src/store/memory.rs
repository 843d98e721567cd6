//! In-memory [`VectorIndex`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so a document replace or
//! delete is atomic with respect to searches. Search is brute-force cosine
//! similarity over the vectors that pass the scope filter.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::EmbeddingModel;

use super::{check_model, rank, ChunkMetadata, IndexEntry, ScopeFilter, ScoredChunk, VectorIndex};

struct StoredVector {
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

#[derive(Default)]
struct Inner {
    model: Option<EmbeddingModel>,
    vectors: HashMap<String, StoredVector>,
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndex {
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index already bound to `model`.
    pub fn with_model(model: EmbeddingModel) -> Self {
        Self {
            inner: RwLock::new(Inner {
                model: Some(model),
                vectors: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.vectors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn bind(&mut self, model: &EmbeddingModel) {
        if self.model.is_none() {
            self.model = Some(model.clone());
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn indexed_model(&self) -> Result<Option<EmbeddingModel>, IndexError> {
        let inner = self.inner.read().map_err(|_| IndexError::Poisoned)?;
        Ok(inner.model.clone())
    }

    async fn upsert(&self, model: &EmbeddingModel, entry: IndexEntry) -> Result<(), IndexError> {
        let mut inner = self.inner.write().map_err(|_| IndexError::Poisoned)?;
        check_model(inner.model.as_ref(), model, entry.vector.len())?;
        inner.bind(model);
        inner.vectors.insert(
            entry.chunk_id,
            StoredVector {
                vector: entry.vector,
                metadata: entry.metadata,
            },
        );
        Ok(())
    }

    async fn replace_document(
        &self,
        model: &EmbeddingModel,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        let mut inner = self.inner.write().map_err(|_| IndexError::Poisoned)?;
        for e in &entries {
            check_model(inner.model.as_ref(), model, e.vector.len())?;
        }
        inner.bind(model);
        inner
            .vectors
            .retain(|_, sv| sv.metadata.document_id != document_id);
        for e in entries {
            inner.vectors.insert(
                e.chunk_id,
                StoredVector {
                    vector: e.vector,
                    metadata: e.metadata,
                },
            );
        }
        Ok(())
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, IndexError> {
        let mut inner = self.inner.write().map_err(|_| IndexError::Poisoned)?;
        Ok(inner.vectors.remove(chunk_id).is_some())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut inner = self.inner.write().map_err(|_| IndexError::Poisoned)?;
        let before = inner.vectors.len();
        inner
            .vectors
            .retain(|_, sv| sv.metadata.document_id != document_id);
        Ok(before - inner.vectors.len())
    }

    async fn search(
        &self,
        model: &EmbeddingModel,
        query: &[f32],
        k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let inner = self.inner.read().map_err(|_| IndexError::Poisoned)?;
        check_model(inner.model.as_ref(), model, query.len())?;

        let mut hits: Vec<ScoredChunk> = inner
            .vectors
            .iter()
            .filter(|(_, sv)| filter.matches(&sv.metadata))
            .map(|(id, sv)| ScoredChunk {
                chunk_id: id.clone(),
                score: cosine_similarity(query, &sv.vector) as f64,
                metadata: sv.metadata.clone(),
            })
            .collect();
        rank(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentClass;

    fn model() -> EmbeddingModel {
        EmbeddingModel::new("test-embed", 3)
    }

    fn entry(chunk_id: &str, doc: &str, kb: Option<&str>, vector: [f32; 3]) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            vector: vector.to_vec(),
            metadata: ChunkMetadata {
                document_id: doc.to_string(),
                chunk_index: 0,
                section_label: None,
                clause_number: None,
                page_number: None,
                document_name: doc.to_string(),
                document_class: DocumentClass::InternalPolicy,
                knowledgebase_id: kb.map(str::to_string),
                text: format!("text of {}", chunk_id),
            },
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_score() {
        let index = InMemoryIndex::new();
        let m = model();
        index.upsert(&m, entry("a", "d1", None, [1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(&m, entry("b", "d1", None, [0.7, 0.7, 0.0])).await.unwrap();
        index.upsert(&m, entry("c", "d2", None, [0.0, 1.0, 0.0])).await.unwrap();

        let hits = index
            .search(&m, &[1.0, 0.1, 0.0], 10, &ScopeFilter::default())
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_upsert_same_chunk_deduplicates() {
        let index = InMemoryIndex::new();
        let m = model();
        index.upsert(&m, entry("a", "d1", None, [1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(&m, entry("a", "d1", None, [0.0, 1.0, 0.0])).await.unwrap();
        let hits = index
            .search(&m, &[0.0, 1.0, 0.0], 10, &ScopeFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_scope_filter_applied_before_truncation() {
        let index = InMemoryIndex::new();
        let m = model();
        for i in 0..5 {
            index
                .upsert(&m, entry(&format!("x{}", i), "other", None, [1.0, 0.0, 0.0]))
                .await
                .unwrap();
        }
        index.upsert(&m, entry("target", "wanted", Some("kb1"), [0.0, 0.0, 1.0])).await.unwrap();

        let hits = index
            .search(&m, &[1.0, 0.0, 0.0], 1, &ScopeFilter::document("wanted"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "target");

        let kb_hits = index
            .search(&m, &[1.0, 0.0, 0.0], 10, &ScopeFilter::knowledgebase("kb1"))
            .await
            .unwrap();
        assert_eq!(kb_hits.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_removes_all_vectors() {
        let index = InMemoryIndex::new();
        let m = model();
        index.upsert(&m, entry("a", "d1", None, [1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(&m, entry("b", "d1", None, [1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(&m, entry("c", "d2", None, [1.0, 0.0, 0.0])).await.unwrap();

        assert_eq!(index.delete_document("d1").await.unwrap(), 2);
        let hits = index
            .search(&m, &[1.0, 0.0, 0.0], 10, &ScopeFilter::default())
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.metadata.document_id == "d2"));
        assert!(index.delete_chunk("c").await.unwrap());
        assert!(!index.delete_chunk("c").await.unwrap());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_replace_document_swaps_set() {
        let index = InMemoryIndex::new();
        let m = model();
        index.upsert(&m, entry("old", "d1", None, [1.0, 0.0, 0.0])).await.unwrap();
        index
            .replace_document(&m, "d1", vec![entry("new", "d1", None, [0.0, 1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        let hits = index
            .search(&m, &[0.0, 1.0, 0.0], 10, &ScopeFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "new");
    }

    #[tokio::test]
    async fn test_model_mismatch_is_hard_error() {
        let index = InMemoryIndex::with_model(model());
        let other = EmbeddingModel::new("other-embed", 3);
        let err = index
            .search(&other, &[1.0, 0.0, 0.0], 5, &ScopeFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::ModelMismatch { .. }));
        assert!(err.is_configuration());

        let err = index
            .upsert(&other, entry("a", "d1", None, [1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_hard_error() {
        let index = InMemoryIndex::with_model(model());
        let err = index
            .search(&model(), &[1.0, 0.0], 5, &ScopeFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { actual: 2, .. }));
    }
}
