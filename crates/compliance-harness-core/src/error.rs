//! Typed errors raised by the core.

use thiserror::Error;

use crate::models::EmbeddingModel;

/// Errors from a [`VectorIndex`](crate::store::VectorIndex) backend.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The query or upserted vector was produced by a different model than
    /// the one the index holds. Fatal, never retried.
    #[error("embedding model mismatch: index holds {indexed}, got {requested}")]
    ModelMismatch {
        indexed: EmbeddingModel,
        requested: EmbeddingModel,
    },
    #[error("vector has {actual} dimensions, model {model} expects {expected}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
    #[error("index lock poisoned")]
    Poisoned,
    #[error("index backend error: {0}")]
    Backend(String),
}

impl IndexError {
    /// True for the configuration-mismatch class: surfaced immediately.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            IndexError::ModelMismatch { .. } | IndexError::DimensionMismatch { .. }
        )
    }
}

/// Model output that does not conform to the verdict schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("model output violates verdict schema: {0}")]
pub struct SchemaViolation(pub String);

/// Failure reported by an external embedding or LLM provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Rate limit, 5xx, or network failure. Safe to retry.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The call did not finish within its time budget. Safe to retry.
    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
    /// Authentication, bad request, or malformed response. Not retried.
    #[error("provider rejected request: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}
