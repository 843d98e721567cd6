//! Prompt construction for the decision engine.
//!
//! The system prompt is the scope's folded prompt (base guardrails plus any
//! applied corrections). The user message carries the evidence set, the
//! optional document under review, recent conversation turns, the query,
//! and the output schema.

use serde::{Deserialize, Serialize};

use crate::error::SchemaViolation;
use crate::models::EvidenceItem;

/// Longest document excerpt embedded in a request, in characters.
pub const MAX_DOCUMENT_CHARS: usize = 5000;

/// Guardrail instructions every scope starts from.
pub const BASE_SYSTEM_PROMPT: &str = "\
You are a banking compliance analyst. You assess questions and documents strictly \
against the regulatory and policy evidence supplied with each request.

RULES:
1. Never fabricate policy text, clause numbers, limits, or document names. Use only the evidence provided.
2. Every analysis point must cite the document_name of the evidence it relies on, exactly as shown.
3. Evidence tagged REGULATOR (central bank circulars and policies) outranks INTERNAL POLICY. \
When they conflict on a requirement, treat the regulator clause as authoritative and state explicitly \
that the conflicting internal clause is superseded.
4. If two REGULATOR items conflict with each other, do not choose between them. Report the conflict \
and return INSUFFICIENT_INFORMATION or PARTIALLY_COMPLIANT.
5. Be conservative. Prefer refusal over guessing. If you are less than 90% confident, return \
INSUFFICIENT_INFORMATION.
6. Respond with a single JSON object and nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior exchange in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

const OUTPUT_SCHEMA: &str = r#"{
  "status": "COMPLIANT | PARTIALLY_COMPLIANT | NON_COMPLIANT | INSUFFICIENT_INFORMATION",
  "confidence_score": 0.0,
  "summary": "one paragraph",
  "analysis": [
    {"point": "...", "clause_reference": "4.2", "document_name": "...", "section_number": "..."}
  ],
  "violations": [
    {"what": "...", "why": "...", "clause": "...", "document_name": "..."}
  ],
  "recommendations": [
    {"recommendation": "...", "priority": "high | medium | low"}
  ]
}"#;

/// Render the evidence set, one labelled block per item.
pub fn format_evidence(evidence: &[EvidenceItem]) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let mut header = format!(
                "[E{}] {} | document_name: {}",
                i + 1,
                e.document_class.authority_label(),
                e.document_name
            );
            if let Some(c) = &e.clause_number {
                header.push_str(&format!(" | Clause {}", c));
            }
            if let Some(s) = &e.section_label {
                header.push_str(&format!(" | Section: {}", s));
            }
            if let Some(p) = e.page_number {
                header.push_str(&format!(" | Page {}", p));
            }
            format!("{}\n{}", header, e.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Build the user message for one decision request.
pub fn compose_request(
    query: &str,
    evidence: &[EvidenceItem],
    document_content: Option<&str>,
    history: &[ConversationTurn],
    retrieval_confidence: f64,
) -> String {
    let mut out = String::from("COMPLIANCE ANALYSIS REQUEST\n\n");

    if !history.is_empty() {
        out.push_str("CONVERSATION SO FAR:\n");
        for turn in history {
            let who = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(&format!("{}: {}\n", who, turn.content.trim()));
        }
        out.push('\n');
    }

    out.push_str(&format!("USER QUERY:\n{}\n\n", query.trim()));
    out.push_str("KNOWLEDGE BASE EVIDENCE:\n");
    out.push_str(&format_evidence(evidence));
    out.push_str("\n\n");

    if let Some(doc) = document_content.filter(|d| !d.trim().is_empty()) {
        out.push_str("DOCUMENT TO ANALYZE:\n");
        out.push_str(truncate_chars(doc, MAX_DOCUMENT_CHARS));
        out.push_str("\n\n");
    }

    out.push_str(&format!(
        "RETRIEVAL CONFIDENCE: {:.2}\n\n",
        retrieval_confidence
    ));
    out.push_str("INSTRUCTIONS:\n");
    out.push_str(
        "Answer using only the evidence above. Cite document_name for every analysis point. \
         Return JSON matching this schema:\n",
    );
    out.push_str(OUTPUT_SCHEMA);
    out
}

/// Corrective instruction appended for the single repair attempt.
pub fn repair_instruction(previous: &str, err: &SchemaViolation) -> String {
    format!(
        "Your previous reply could not be used: {}.\n\nPrevious reply:\n{}\n\n\
         Reply again with only a JSON object that matches the schema exactly. \
         status must be one of COMPLIANT, PARTIALLY_COMPLIANT, NON_COMPLIANT, \
         INSUFFICIENT_INFORMATION and confidence_score must be a number between 0 and 1.",
        err.0,
        truncate_chars(previous, 2000)
    )
}
