//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines the operations the retrieval pipeline
//! needs from a vector database, enabling pluggable backends (SQLite,
//! in-memory).
//!
//! # Contract
//!
//! | Method | Guarantee |
//! |--------|-----------|
//! | [`upsert`](VectorIndex::upsert) | Inserts or replaces one chunk vector |
//! | [`replace_document`](VectorIndex::replace_document) | Swaps all of a document's vectors in one step |
//! | [`delete_chunk`](VectorIndex::delete_chunk) / [`delete_document`](VectorIndex::delete_document) | No dangling hits once the call returns |
//! | [`search`](VectorIndex::search) | Scores non-increasing, unique chunk ids, scope filter applied before ranking |
//!
//! Every index is bound to a single [`EmbeddingModel`]. Writing or querying
//! with a different model or dimensionality fails with
//! [`IndexError::ModelMismatch`] / [`IndexError::DimensionMismatch`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::models::{Chunk, Document, DocumentClass, EmbeddingModel};

/// Metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_index: i64,
    pub section_label: Option<String>,
    pub clause_number: Option<String>,
    pub page_number: Option<u32>,
    pub document_name: String,
    pub document_class: DocumentClass,
    pub knowledgebase_id: Option<String>,
    pub text: String,
}

impl ChunkMetadata {
    pub fn from_chunk(doc: &Document, chunk: &Chunk) -> Self {
        Self {
            document_id: doc.id.clone(),
            chunk_index: chunk.chunk_index,
            section_label: chunk.section_label.clone(),
            clause_number: chunk.clause_number.clone(),
            page_number: chunk.page_number,
            document_name: doc.name.clone(),
            document_class: doc.class,
            knowledgebase_id: doc.knowledgebase_id.clone(),
            text: chunk.text.clone(),
        }
    }
}

/// One vector ready to be written to the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f64,
    pub metadata: ChunkMetadata,
}

/// Hard scope restriction applied inside the index before ranking.
///
/// Empty filter means "whole corpus". All present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeFilter {
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub knowledgebase_id: Option<String>,
    #[serde(default)]
    pub classes: Option<Vec<DocumentClass>>,
}

impl ScopeFilter {
    pub fn document(id: impl Into<String>) -> Self {
        Self {
            document_ids: Some(vec![id.into()]),
            ..Default::default()
        }
    }

    pub fn knowledgebase(id: impl Into<String>) -> Self {
        Self {
            knowledgebase_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == &meta.document_id) {
                return false;
            }
        }
        if let Some(kb) = &self.knowledgebase_id {
            if meta.knowledgebase_id.as_deref() != Some(kb.as_str()) {
                return false;
            }
        }
        if let Some(classes) = &self.classes {
            if !classes.contains(&meta.document_class) {
                return false;
            }
        }
        true
    }
}

/// Abstract vector database used by ingestion and retrieval.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The model this index is bound to, or `None` while it is empty and unbound.
    async fn indexed_model(&self) -> Result<Option<EmbeddingModel>, IndexError>;

    /// Insert or replace one chunk vector.
    async fn upsert(&self, model: &EmbeddingModel, entry: IndexEntry) -> Result<(), IndexError>;

    /// Replace every vector belonging to `document_id` with `entries`.
    ///
    /// Concurrent searches observe either the old set or the new set.
    async fn replace_document(
        &self,
        model: &EmbeddingModel,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError>;

    /// Remove one chunk vector. Returns whether it existed.
    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, IndexError>;

    /// Remove all vectors of a document. Returns how many were removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Return up to `k` nearest chunks inside `filter`, best first.
    async fn search(
        &self,
        model: &EmbeddingModel,
        query: &[f32],
        k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError>;
}

/// Validate a vector against the model it claims and the model the index holds.
pub fn check_model(
    indexed: Option<&EmbeddingModel>,
    requested: &EmbeddingModel,
    vector_len: usize,
) -> Result<(), IndexError> {
    if vector_len != requested.dims {
        return Err(IndexError::DimensionMismatch {
            model: requested.name.clone(),
            expected: requested.dims,
            actual: vector_len,
        });
    }
    match indexed {
        Some(m) if m != requested => Err(IndexError::ModelMismatch {
            indexed: m.clone(),
            requested: requested.clone(),
        }),
        _ => Ok(()),
    }
}

/// Order hits best first; equal scores fall back to chunk id for stability.
pub fn rank(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
