//! Compliance verdict schema, model-output parsing, and the gate.
//!
//! Model output is untrusted. [`parse_model_output`] turns raw text into a
//! [`ModelVerdict`] or a [`SchemaViolation`]; [`finalize`] then applies the
//! structural guardrails that code can enforce:
//!
//! - citations of documents outside the evidence set are dropped
//! - a verdict with no cited analysis left falls back to `INSUFFICIENT_INFORMATION`
//! - weak retrieval caps the model's confidence at the retrieval confidence
//! - confidence under the threshold forces `INSUFFICIENT_INFORMATION`
//! - an `INSUFFICIENT_INFORMATION` verdict never carries violations
//!
//! Semantic rules (regulator evidence outranks internal policy) live in the
//! guardrail prompt; the gate cannot check them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchemaViolation;
use crate::models::{DocumentClass, EvidenceItem};

/// Appended to every verdict.
pub const DISCLAIMER: &str =
    "This assessment is based solely on the uploaded documents and available regulatory references.";

/// The closed compliance taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplianceStatus {
    #[serde(rename = "COMPLIANT")]
    Compliant,
    #[serde(rename = "PARTIALLY_COMPLIANT", alias = "PARTIALLY COMPLIANT")]
    PartiallyCompliant,
    #[serde(rename = "NON_COMPLIANT", alias = "NON-COMPLIANT")]
    NonCompliant,
    #[serde(rename = "INSUFFICIENT_INFORMATION", alias = "INSUFFICIENT INFORMATION")]
    InsufficientInformation,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "COMPLIANT",
            ComplianceStatus::PartiallyCompliant => "PARTIALLY_COMPLIANT",
            ComplianceStatus::NonCompliant => "NON_COMPLIANT",
            ComplianceStatus::InsufficientInformation => "INSUFFICIENT_INFORMATION",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = SchemaViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match norm.as_str() {
            "COMPLIANT" => Ok(ComplianceStatus::Compliant),
            "PARTIALLY_COMPLIANT" => Ok(ComplianceStatus::PartiallyCompliant),
            "NON_COMPLIANT" => Ok(ComplianceStatus::NonCompliant),
            "INSUFFICIENT_INFORMATION" => Ok(ComplianceStatus::InsufficientInformation),
            _ => Err(SchemaViolation(format!("unknown status '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "HIGH", alias = "High")]
    High,
    #[serde(alias = "MEDIUM", alias = "Medium")]
    Medium,
    #[serde(alias = "LOW", alias = "Low")]
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPoint {
    pub point: String,
    #[serde(default)]
    pub clause_reference: Option<String>,
    /// Name (or id) of the evidence document this point relies on.
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub section_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub what: String,
    pub why: String,
    #[serde(default)]
    pub clause: Option<String>,
    #[serde(default)]
    pub document_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommendation: String,
    pub priority: Priority,
}

/// A document actually cited by the final analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub document_id: String,
    pub document_name: String,
    pub document_class: DocumentClass,
}

/// The validated, gated answer returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub status: ComplianceStatus,
    pub confidence_score: f64,
    pub summary: String,
    pub analysis: Vec<AnalysisPoint>,
    pub violations: Vec<Violation>,
    /// Ordered high → low priority.
    pub recommendations: Vec<Recommendation>,
    pub source_documents: Vec<SourceDocument>,
    pub disclaimer: String,
}

/// Model output that passed schema validation but not yet the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVerdict {
    pub status: ComplianceStatus,
    pub confidence_score: f64,
    pub summary: String,
    pub analysis: Vec<AnalysisPoint>,
    pub violations: Vec<Violation>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Deserialize)]
struct RawVerdict {
    status: String,
    confidence_score: f64,
    summary: String,
    analysis: Vec<AnalysisPoint>,
    #[serde(default)]
    violations: Vec<Violation>,
    #[serde(default)]
    recommendations: Vec<Recommendation>,
}

/// Why the gate overrode the model's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downgrade {
    LowConfidence,
    /// The model was confident but the retrieved evidence was not.
    WeakRetrieval,
    NoCitedAnalysis,
}

/// What the gate changed, for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateReport {
    pub dropped_points: usize,
    pub dropped_violations: usize,
    pub downgrade: Option<Downgrade>,
    /// Model confidence before the retrieval cap lowered it.
    pub capped_from: Option<f64>,
}

/// Remove a surrounding markdown code fence and any prose around the object.
fn extract_json(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        s = s.trim_end().strip_suffix("```").unwrap_or(s).trim();
    }
    match (s.find('{'), s.rfind('}')) {
        (Some(start), Some(end)) if start < end => &s[start..=end],
        _ => s,
    }
}

/// Parse and validate raw model text against the verdict schema.
pub fn parse_model_output(raw: &str) -> Result<ModelVerdict, SchemaViolation> {
    let json = extract_json(raw);
    let parsed: RawVerdict =
        serde_json::from_str(json).map_err(|e| SchemaViolation(e.to_string()))?;

    let status: ComplianceStatus = parsed.status.parse()?;
    if !parsed.confidence_score.is_finite() || !(0.0..=1.0).contains(&parsed.confidence_score) {
        return Err(SchemaViolation(format!(
            "confidence_score {} outside [0, 1]",
            parsed.confidence_score
        )));
    }
    if parsed.summary.trim().is_empty() {
        return Err(SchemaViolation("summary is empty".to_string()));
    }
    if parsed.analysis.iter().any(|p| p.point.trim().is_empty()) {
        return Err(SchemaViolation("analysis point with empty text".to_string()));
    }

    Ok(ModelVerdict {
        status,
        confidence_score: parsed.confidence_score,
        summary: parsed.summary,
        analysis: parsed.analysis,
        violations: parsed.violations,
        recommendations: parsed.recommendations,
    })
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Find the evidence document a citation refers to, by name or id.
fn cited_document<'a>(citation: &str, evidence: &'a [EvidenceItem]) -> Option<&'a EvidenceItem> {
    let c = normalize(citation);
    evidence
        .iter()
        .find(|e| normalize(&e.document_name) == c || normalize(&e.document_id) == c)
}

/// Apply the citation and confidence guardrails.
///
/// When `retrieval_confidence` is under the threshold the verdict's
/// confidence is `min(model, retrieval)`, so weak evidence cannot yield a
/// confident answer.
pub fn finalize(
    model: ModelVerdict,
    evidence: &[EvidenceItem],
    confidence_threshold: f64,
    retrieval_confidence: f64,
) -> (ComplianceVerdict, GateReport) {
    let mut report = GateReport::default();
    let mut status = model.status;

    let mut confidence = model.confidence_score;
    if retrieval_confidence < confidence_threshold && retrieval_confidence < confidence {
        report.capped_from = Some(confidence);
        confidence = retrieval_confidence;
    }

    let before = model.analysis.len();
    let analysis: Vec<AnalysisPoint> = model
        .analysis
        .into_iter()
        .filter(|p| match &p.document_name {
            Some(name) => cited_document(name, evidence).is_some(),
            None => true,
        })
        .collect();
    report.dropped_points = before - analysis.len();

    let mut source_documents: Vec<SourceDocument> = Vec::new();
    for p in &analysis {
        if let Some(ev) = p
            .document_name
            .as_deref()
            .and_then(|n| cited_document(n, evidence))
        {
            if !source_documents.iter().any(|s| s.document_id == ev.document_id) {
                source_documents.push(SourceDocument {
                    document_id: ev.document_id.clone(),
                    document_name: ev.document_name.clone(),
                    document_class: ev.document_class,
                });
            }
        }
    }

    let before = model.violations.len();
    let mut violations: Vec<Violation> = model
        .violations
        .into_iter()
        .filter(|v| match &v.document_name {
            Some(name) => cited_document(name, evidence).is_some(),
            None => true,
        })
        .collect();
    report.dropped_violations = before - violations.len();

    if status != ComplianceStatus::InsufficientInformation && source_documents.is_empty() {
        status = ComplianceStatus::InsufficientInformation;
        report.downgrade = Some(Downgrade::NoCitedAnalysis);
    }
    if confidence < confidence_threshold && status != ComplianceStatus::InsufficientInformation {
        status = ComplianceStatus::InsufficientInformation;
        report.downgrade = Some(if model.confidence_score >= confidence_threshold {
            Downgrade::WeakRetrieval
        } else {
            Downgrade::LowConfidence
        });
    }
    if status == ComplianceStatus::InsufficientInformation {
        report.dropped_violations += violations.len();
        violations.clear();
    }

    let mut recommendations = model.recommendations;
    recommendations.sort_by_key(|r| r.priority);

    let verdict = ComplianceVerdict {
        status,
        confidence_score: confidence,
        summary: model.summary,
        analysis,
        violations,
        recommendations,
        source_documents,
        disclaimer: DISCLAIMER.to_string(),
    };
    (verdict, report)
}

/// The verdict returned without calling the model when no evidence passed retrieval.
pub fn insufficient_verdict() -> ComplianceVerdict {
    ComplianceVerdict {
        status: ComplianceStatus::InsufficientInformation,
        confidence_score: 0.0,
        summary: "No relevant regulatory or policy references were found for this query."
            .to_string(),
        analysis: Vec::new(),
        violations: Vec::new(),
        recommendations: vec![Recommendation {
            recommendation: "Upload or reference the governing circular or policy and ask again."
                .to_string(),
            priority: Priority::Medium,
        }],
        source_documents: Vec::new(),
        disclaimer: DISCLAIMER.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(id: &str, name: &str, class: DocumentClass) -> EvidenceItem {
        EvidenceItem {
            chunk_id: format!("{}-0", id),
            document_id: id.to_string(),
            document_name: name.to_string(),
            document_class: class,
            section_label: Some("Section 4.2 Cash Reporting".into()),
            clause_number: Some("4.2".into()),
            page_number: None,
            similarity: 0.8,
            text: "Cash transactions above PKR 2,000,000 must be reported.".into(),
        }
    }

    fn output(status: &str, confidence: f64, doc: &str) -> String {
        format!(
            r#"{{
                "status": "{status}",
                "confidence_score": {confidence},
                "summary": "Threshold found.",
                "analysis": [{{"point": "Clause 4.2 sets the threshold.", "clause_reference": "4.2", "document_name": "{doc}"}}],
                "violations": [{{"what": "Late report", "why": "Exceeded 7 days", "clause": "4.2"}}],
                "recommendations": [
                    {{"recommendation": "Train staff", "priority": "low"}},
                    {{"recommendation": "File report", "priority": "HIGH"}}
                ]
            }}"#
        )
    }

    #[test]
    fn test_parse_strips_fence() {
        let raw = format!("```json\n{}\n```", output("NON-COMPLIANT", 0.95, "AML-Policy-v2"));
        let v = parse_model_output(&raw).unwrap();
        assert_eq!(v.status, ComplianceStatus::NonCompliant);
        assert_eq!(v.recommendations.len(), 2);
    }

    #[test]
    fn test_parse_status_spellings() {
        for s in ["PARTIALLY COMPLIANT", "partially_compliant", "Partially-Compliant"] {
            assert_eq!(
                s.parse::<ComplianceStatus>().unwrap(),
                ComplianceStatus::PartiallyCompliant
            );
        }
        assert!("MOSTLY_FINE".parse::<ComplianceStatus>().is_err());
    }

    #[test]
    fn test_parse_rejects_schema_violations() {
        assert!(parse_model_output("I think it is compliant.").is_err());
        assert!(parse_model_output(&output("COMPLIANT", 1.5, "x")).is_err());
        assert!(parse_model_output(&output("MAYBE", 0.9, "x")).is_err());
        assert!(parse_model_output(r#"{"status": "COMPLIANT", "confidence_score": 0.9}"#).is_err());
    }

    #[test]
    fn test_low_confidence_forces_insufficient() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        for status in ["COMPLIANT", "NON_COMPLIANT", "PARTIALLY_COMPLIANT"] {
            let m = parse_model_output(&output(status, 0.6, "AML-Policy-v2")).unwrap();
            let (v, report) = finalize(m, &ev, 0.9, 1.0);
            assert_eq!(v.status, ComplianceStatus::InsufficientInformation);
            assert!(v.violations.is_empty());
            assert_eq!(report.downgrade, Some(Downgrade::LowConfidence));
        }
    }

    #[test]
    fn test_confident_verdict_keeps_status_and_sources() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        let m = parse_model_output(&output("NON_COMPLIANT", 0.95, "aml-policy-v2")).unwrap();
        let (v, report) = finalize(m, &ev, 0.9, 1.0);
        assert_eq!(v.status, ComplianceStatus::NonCompliant);
        assert_eq!(v.violations.len(), 1);
        assert_eq!(v.source_documents.len(), 1);
        assert_eq!(v.source_documents[0].document_name, "AML-Policy-v2");
        assert_eq!(v.recommendations[0].priority, Priority::High);
        assert_eq!(v.disclaimer, DISCLAIMER);
        assert_eq!(report, GateReport::default());
    }

    #[test]
    fn test_hallucinated_citation_dropped() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        let m = parse_model_output(&output("COMPLIANT", 0.97, "Imaginary-Circular-9")).unwrap();
        let (v, report) = finalize(m, &ev, 0.9, 1.0);
        assert!(v
            .analysis
            .iter()
            .all(|p| p.document_name.as_deref() != Some("Imaginary-Circular-9")));
        assert_eq!(report.dropped_points, 1);
        assert_eq!(v.status, ComplianceStatus::InsufficientInformation);
        assert_eq!(report.downgrade, Some(Downgrade::NoCitedAnalysis));
        assert!(v.source_documents.is_empty());
    }

    #[test]
    fn test_citation_by_document_id() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        let m = parse_model_output(&output("COMPLIANT", 0.97, "d1")).unwrap();
        let (v, _) = finalize(m, &ev, 0.9, 1.0);
        assert_eq!(v.status, ComplianceStatus::Compliant);
        assert_eq!(v.source_documents[0].document_id, "d1");
    }

    #[test]
    fn test_weak_retrieval_caps_confidence() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        let m = parse_model_output(&output("COMPLIANT", 0.95, "AML-Policy-v2")).unwrap();
        let (v, report) = finalize(m, &ev, 0.7, 0.62);
        assert_eq!(v.status, ComplianceStatus::InsufficientInformation);
        assert_eq!(v.confidence_score, 0.62);
        assert_eq!(report.capped_from, Some(0.95));
        assert_eq!(report.downgrade, Some(Downgrade::WeakRetrieval));
    }

    #[test]
    fn test_strong_retrieval_leaves_confidence() {
        let ev = vec![evidence("d1", "AML-Policy-v2", DocumentClass::InternalPolicy)];
        let m = parse_model_output(&output("COMPLIANT", 0.95, "AML-Policy-v2")).unwrap();
        let (v, report) = finalize(m, &ev, 0.5, 0.62);
        assert_eq!(v.status, ComplianceStatus::Compliant);
        assert_eq!(v.confidence_score, 0.95);
        assert_eq!(report.capped_from, None);
    }

    #[test]
    fn test_insufficient_verdict_shape() {
        let v = insufficient_verdict();
        assert_eq!(v.status, ComplianceStatus::InsufficientInformation);
        assert!(v.source_documents.is_empty());
        assert!(v.violations.is_empty());
        assert_eq!(v.confidence_score, 0.0);
    }

    #[test]
    fn test_status_serializes_with_underscores() {
        let json = serde_json::to_string(&ComplianceStatus::NonCompliant).unwrap();
        assert_eq!(json, "\"NON_COMPLIANT\"");
        let back: ComplianceStatus = serde_json::from_str("\"PARTIALLY COMPLIANT\"").unwrap();
        assert_eq!(back, ComplianceStatus::PartiallyCompliant);
    }
}
