//! Core data models shared by the ingestion and decision pipelines.
//!
//! These types describe documents, their chunks, the embedding model that
//! produced a vector, the evidence assembled for a query, and the
//! operator corrections that patch the decision prompt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a document's authority comes from.
///
/// Regulator-issued material outranks internal policy when the two
/// disagree; the decision prompt tags every evidence line with this class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentClass {
    RegulatorCircular,
    RegulatorPolicy,
    InternalPolicy,
    Guideline,
    UserUpload,
}

impl DocumentClass {
    pub fn is_regulator(&self) -> bool {
        matches!(
            self,
            DocumentClass::RegulatorCircular | DocumentClass::RegulatorPolicy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentClass::RegulatorCircular => "regulator_circular",
            DocumentClass::RegulatorPolicy => "regulator_policy",
            DocumentClass::InternalPolicy => "internal_policy",
            DocumentClass::Guideline => "guideline",
            DocumentClass::UserUpload => "user_upload",
        }
    }

    /// Authority label shown to the model next to each evidence item.
    pub fn authority_label(&self) -> &'static str {
        match self {
            DocumentClass::RegulatorCircular | DocumentClass::RegulatorPolicy => "REGULATOR",
            DocumentClass::InternalPolicy => "INTERNAL POLICY",
            DocumentClass::Guideline => "GUIDELINE",
            DocumentClass::UserUpload => "USER UPLOAD",
        }
    }
}

impl fmt::Display for DocumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "regulator_circular" | "circular" => Ok(DocumentClass::RegulatorCircular),
            "regulator_policy" | "regulator" => Ok(DocumentClass::RegulatorPolicy),
            "internal_policy" | "internal" => Ok(DocumentClass::InternalPolicy),
            "guideline" => Ok(DocumentClass::Guideline),
            "user_upload" | "upload" => Ok(DocumentClass::UserUpload),
            other => Err(format!(
                "unknown document class '{}'. Expected one of: regulator_circular, \
                 regulator_policy, internal_policy, guideline, user_upload",
                other
            )),
        }
    }
}

/// Processing state of a document in the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unparsed,
    Processed,
    /// Ingestion failed; the error text is retained for operators.
    Failed(String),
}

impl ProcessingStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingStatus::Unparsed => "unparsed",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ProcessingStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Rebuild a status from its stored label and optional error column.
    pub fn from_parts(label: &str, error: Option<String>) -> Self {
        match label {
            "processed" => ProcessingStatus::Processed,
            "failed" => ProcessingStatus::Failed(error.unwrap_or_default()),
            _ => ProcessingStatus::Unparsed,
        }
    }
}

/// A document handed to the core by the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Human-readable name used in citations (e.g. `"AML-Policy-v2"`).
    pub name: String,
    pub class: DocumentClass,
    pub knowledgebase_id: Option<String>,
    pub status: ProcessingStatus,
    pub chunk_count: usize,
}

impl Document {
    /// A freshly uploaded document, not yet chunked.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        class: DocumentClass,
        knowledgebase_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class,
            knowledgebase_id,
            status: ProcessingStatus::Unparsed,
            chunk_count: 0,
        }
    }
}

/// A bounded, positionally tracked slice of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Nearest preceding heading, never fabricated.
    pub section_label: Option<String>,
    /// Dotted clause number found inside the heading, if any.
    pub clause_number: Option<String>,
    pub page_number: Option<u32>,
    pub token_count: usize,
    /// Index of this chunk's first token in the document token sequence.
    pub start_token: usize,
    /// Number of leading tokens repeated from the previous chunk.
    pub overlap_tokens: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Identity of the model that produced a vector.
///
/// All vectors compared in one search must share this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    pub dims: usize,
}

impl EmbeddingModel {
    pub fn new(name: impl Into<String>, dims: usize) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }
}

impl fmt::Display for EmbeddingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}d", self.name, self.dims)
    }
}

/// One piece of evidence assembled for a single query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub document_class: DocumentClass,
    pub section_label: Option<String>,
    pub clause_number: Option<String>,
    pub page_number: Option<u32>,
    pub similarity: f64,
    pub text: String,
}

/// An operator-authored patch to future answers for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub scope: String,
    pub original_query: String,
    pub original_response: String,
    pub correction_text: String,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

/// The folded system prompt currently active for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopePrompt {
    pub scope: String,
    /// Incremented on every apply that folds at least one correction.
    pub version: u64,
    pub text: String,
    /// Corrections folded into `text` so far; numbers the next entry.
    pub applied_count: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_parse_aliases() {
        assert_eq!(
            "regulator-circular".parse::<DocumentClass>().unwrap(),
            DocumentClass::RegulatorCircular
        );
        assert_eq!(
            "Internal".parse::<DocumentClass>().unwrap(),
            DocumentClass::InternalPolicy
        );
        assert!("memo".parse::<DocumentClass>().is_err());
    }

    #[test]
    fn test_regulator_classes() {
        assert!(DocumentClass::RegulatorPolicy.is_regulator());
        assert!(!DocumentClass::InternalPolicy.is_regulator());
        assert!(!DocumentClass::UserUpload.is_regulator());
    }

    #[test]
    fn test_status_from_parts() {
        assert_eq!(
            ProcessingStatus::from_parts("failed", Some("boom".into())),
            ProcessingStatus::Failed("boom".into())
        );
        assert_eq!(
            ProcessingStatus::from_parts("processed", None),
            ProcessingStatus::Processed
        );
        assert_eq!(
            ProcessingStatus::from_parts("whatever", None),
            ProcessingStatus::Unparsed
        );
    }
}
