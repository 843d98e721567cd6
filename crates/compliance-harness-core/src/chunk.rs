//! Token-window text chunker with sentence snapping and heading propagation.
//!
//! Splits extracted document text into [`Chunk`]s of at most `max_tokens`
//! tokens. Consecutive chunks share the trailing `overlap_tokens` tokens of
//! the previous chunk so that a clause straddling a boundary stays
//! retrievable from either side.
//!
//! A token is a maximal run of non-whitespace characters. Chunk text is the
//! exact slice of the source between its first and last token, so original
//! spacing and line breaks inside a chunk are preserved.
//!
//! # Algorithm
//!
//! 1. Tokenize the text into byte spans.
//! 2. Detect regulatory headings (`Section 4.2`, `3.1 Cash Reporting`,
//!    `Annex B`, `Chapter 7`, markdown `#` headings) and form-feed page breaks.
//! 3. From `start`, take the window `[start, start + max_tokens)`.
//! 4. If the window does not reach the end of the text, pull its end back to
//!    the last sentence terminator found within `sentence_lookback` tokens.
//!    With no terminator in range the window is hard-split at `max_tokens`.
//! 5. Emit the chunk; the next window starts `overlap_tokens` before the end.
//!
//! # Guarantees
//!
//! - Every chunk has `token_count <= max_tokens`.
//! - Dropping each chunk's leading `overlap_tokens` tokens and concatenating
//!   the rest reproduces the document's token sequence exactly.
//! - A document with at most `max_tokens` tokens yields exactly one chunk.
//! - Empty or whitespace-only text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use compliance_harness_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams { max_tokens: 400, overlap_tokens: 50, sentence_lookback: 40 };
//! let chunks = chunk_text("doc-123", "Section 1. Cash above 2,500,000 must be reported.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].clause_number.as_deref(), Some("1"));
//! ```

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::models::Chunk;

/// Chunking parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    /// Maximum tokens per chunk (`T`).
    pub max_tokens: usize,
    /// Tokens repeated at the start of each following chunk (`O`, `O < T`).
    pub overlap_tokens: usize,
    /// How far back from a window end to look for a sentence terminator.
    pub sentence_lookback: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
            sentence_lookback: 40,
        }
    }
}

struct Heading {
    offset: usize,
    label: String,
    clause: Option<String>,
}

fn heading_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^(?:SECTION|Section|CLAUSE|Clause|ARTICLE|Article)\s+\d+(?:\.\d+)*(?:[:.\s]|$)",
            r"^\d+(?:\.\d+)*\.?\s+[A-Z][A-Za-z\s,&/-]+$",
            r"^(?:ANNEX|Annex|APPENDIX|Appendix)\s+[A-Z0-9]",
            r"^(?:CHAPTER|Chapter|PART|Part)\s+[0-9IVX]+",
            r"^#{1,6}\s+\S",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("heading pattern is valid"))
        .collect()
    })
}

fn clause_pattern() -> &'static Regex {
    static CLAUSE: OnceLock<Regex> = OnceLock::new();
    CLAUSE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)*").expect("clause pattern is valid"))
}

/// Split text into overlapping token-bounded chunks.
///
/// Chunk ids are derived from `document_id` and the chunk index, so
/// re-chunking the same text yields the same ids.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let spans = token_spans(text);
    if spans.is_empty() {
        return Vec::new();
    }

    let max_tokens = params.max_tokens.max(1);
    let overlap = params.overlap_tokens.min(max_tokens - 1);
    let headings = detect_headings(text);
    let page_breaks: Vec<usize> = text.match_indices('\x0c').map(|(i, _)| i).collect();

    let n = spans.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut carried = 0usize;

    loop {
        let hard_end = (start + max_tokens).min(n);
        let end = if hard_end < n {
            let min_end = start + overlap + 1;
            snap_to_sentence(text, &spans, min_end, hard_end, params.sentence_lookback)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let first_new = spans[start + carried].0;
        let heading = headings.iter().take_while(|h| h.offset <= first_new).last();
        let page_number = if page_breaks.is_empty() {
            None
        } else {
            Some(1 + page_breaks.iter().filter(|&&p| p < first_new).count() as u32)
        };

        let body = &text[spans[start].0..spans[end - 1].1];
        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            body,
            heading,
            page_number,
            start,
            end - start,
            carried,
        ));

        if end == n {
            break;
        }
        carried = overlap;
        start = end - overlap;
    }

    chunks
}

/// Byte spans of whitespace-delimited tokens.
pub fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut token_start: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = token_start.take() {
                spans.push((s, i));
            }
        } else if token_start.is_none() {
            token_start = Some(i);
        }
    }
    if let Some(s) = token_start {
        spans.push((s, text.len()));
    }
    spans
}

/// Number of tokens in `text` under the chunker's tokenization.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Find the largest window end in `[max(min_end, hard_end - lookback), hard_end]`
/// whose last token closes a sentence.
fn snap_to_sentence(
    text: &str,
    spans: &[(usize, usize)],
    min_end: usize,
    hard_end: usize,
    lookback: usize,
) -> Option<usize> {
    let lower = min_end.max(hard_end.saturating_sub(lookback));
    (lower..=hard_end)
        .rev()
        .find(|&end| end > 0 && ends_sentence(&text[spans[end - 1].0..spans[end - 1].1]))
}

fn ends_sentence(token: &str) -> bool {
    let trimmed = token.trim_end_matches(['"', '\'', ')', ']', '”', '’']);
    trimmed.ends_with(['.', '!', '?'])
}

fn detect_headings(text: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if !trimmed.is_empty() && heading_patterns().iter().any(|p| p.is_match(trimmed)) {
            let label = trimmed.trim_start_matches('#').trim().to_string();
            let clause = clause_pattern()
                .find(&label)
                .map(|m| m.as_str().to_string());
            headings.push(Heading {
                offset,
                label,
                clause,
            });
        }
        offset += line.len();
    }
    headings
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    document_id: &str,
    index: i64,
    text: &str,
    heading: Option<&Heading>,
    page_number: Option<u32>,
    start_token: usize,
    token_count: usize,
    overlap_tokens: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        section_label: heading.map(|h| h.label.clone()),
        clause_number: heading.and_then(|h| h.clause.clone()),
        page_number,
        token_count,
        start_token,
        overlap_tokens,
        hash,
    }
}

/// Deterministic chunk id: first 32 hex chars of `sha256(document_id ":" index)`.
pub fn chunk_id(document_id: &str, index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}
