//! Plain text extraction for the `chk ingest` command.
//!
//! Callers of the library hand over text that was already extracted; this
//! module only covers the CLI path. PDF pages are joined with form feeds
//! so the chunker can assign page numbers.

use std::path::Path;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("text is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Content type from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => MIME_PDF,
        _ => MIME_TEXT,
    }
}

/// Extract text from raw bytes of the given content type.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_TEXT => String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::InvalidUtf8),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    extract_text(&bytes, content_type_for(path))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(pages.join("\x0c"))
}
