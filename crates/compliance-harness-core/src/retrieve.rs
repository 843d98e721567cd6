//! Evidence assembly from an embedded query.
//!
//! The index is asked for `top_k × widen_factor` candidates so that hits
//! falling under `min_similarity` do not leave the evidence set short.
//! When nothing passes the threshold the set is empty; the threshold is
//! never relaxed. An empty set routes the decision engine straight to
//! `INSUFFICIENT_INFORMATION`.

use std::collections::HashSet;

use crate::error::IndexError;
use crate::models::{EmbeddingModel, EvidenceItem};
use crate::store::{ScopeFilter, ScoredChunk, VectorIndex};

/// Parameters for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub top_k: usize,
    pub min_similarity: f64,
    /// Internal over-fetch multiplier applied before threshold filtering.
    pub widen_factor: usize,
    pub filter: ScopeFilter,
}

impl Default for RetrieveParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.25,
            widen_factor: 2,
            filter: ScopeFilter::default(),
        }
    }
}

/// Search `index` with an already embedded query and build the evidence set.
pub async fn retrieve(
    index: &dyn VectorIndex,
    model: &EmbeddingModel,
    query_vector: &[f32],
    params: &RetrieveParams,
) -> Result<Vec<EvidenceItem>, IndexError> {
    if params.top_k == 0 {
        return Ok(Vec::new());
    }
    let fetch = params.top_k.saturating_mul(params.widen_factor.max(1));
    let hits = index
        .search(model, query_vector, fetch, &params.filter)
        .await?;
    Ok(assemble_evidence(hits, params.top_k, params.min_similarity))
}

/// Threshold, deduplicate, and cap raw hits. Input order is preserved.
pub fn assemble_evidence(
    hits: Vec<ScoredChunk>,
    top_k: usize,
    min_similarity: f64,
) -> Vec<EvidenceItem> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| h.score >= min_similarity)
        .filter(|h| seen.insert(h.chunk_id.clone()))
        .take(top_k)
        .map(|h| EvidenceItem {
            chunk_id: h.chunk_id,
            document_id: h.metadata.document_id,
            document_name: h.metadata.document_name,
            document_class: h.metadata.document_class,
            section_label: h.metadata.section_label,
            clause_number: h.metadata.clause_number,
            page_number: h.metadata.page_number,
            similarity: h.score,
            text: h.metadata.text,
        })
        .collect()
}

/// How much the evidence set alone supports an answer, in `[0, 1]`.
///
/// Weighted from mean similarity (0.6), how full the set is relative to
/// `top_k` (0.3), and a base of 0.1 plus up to 0.1 for the share of
/// regulator evidence. An empty set scores 0.
pub fn retrieval_confidence(evidence: &[EvidenceItem], top_k: usize) -> f64 {
    if evidence.is_empty() {
        return 0.0;
    }
    let n = evidence.len() as f64;
    let avg_similarity = evidence.iter().map(|e| e.similarity).sum::<f64>() / n;
    let fill = (n / top_k.max(1) as f64).min(1.0);
    let regulator = evidence
        .iter()
        .filter(|e| e.document_class.is_regulator())
        .count() as f64;
    let authority = 0.1 * regulator / n;
    (0.6 * avg_similarity + 0.3 * fill + 0.1 + authority).clamp(0.0, 1.0)
}
