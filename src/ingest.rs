//! Ingestion pipeline orchestration.
//!
//! Drives one document through chunk → embed → index and records the
//! resulting [`ProcessingStatus`]. At most one run per document id is in
//! flight: a second request while the lease is held is rejected with
//! [`IngestError::InProgress`], never queued.
//!
//! Any failure after the lease is taken marks the document
//! `failed(error)` with the error text kept for operators.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use compliance_harness_core::chunk::{chunk_text, ChunkParams};
use compliance_harness_core::error::IndexError;
use compliance_harness_core::models::{Document, DocumentClass, ProcessingStatus};
use compliance_harness_core::store::{ChunkMetadata, IndexEntry};

use crate::config::Config;
use crate::embed::{EmbedError, Embedder};
use crate::sqlite_store::SqliteStore;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("parse in progress for document {0}")]
    InProgress(String),
    #[error("document {0} has no extractable text")]
    Empty(String),
    #[error(transparent)]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Per-document single-flight leases.
#[derive(Clone, Default)]
pub struct IngestLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Held while a document is being ingested; released on drop.
pub struct IngestLease {
    document_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl IngestLeases {
    /// Take the lease for `document_id`, or `None` if another run holds it.
    pub fn try_acquire(&self, document_id: &str) -> Option<IngestLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(document_id.to_string()) {
            return None;
        }
        Some(IngestLease {
            document_id: document_id.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, document_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(document_id)
    }
}

impl Drop for IngestLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.document_id);
    }
}

/// Result handed back to the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub chunk_count: usize,
    pub status: ProcessingStatus,
}

/// Runs the chunk → embed → index pipeline.
#[derive(Clone)]
pub struct Ingestor {
    store: SqliteStore,
    embedder: Embedder,
    params: ChunkParams,
    leases: IngestLeases,
}

impl Ingestor {
    pub fn new(store: SqliteStore, embedder: Embedder, params: ChunkParams) -> Self {
        Self {
            store,
            embedder,
            params,
            leases: IngestLeases::default(),
        }
    }

    pub fn leases(&self) -> &IngestLeases {
        &self.leases
    }

    fn acquire(&self, document_id: &str) -> Result<IngestLease, IngestError> {
        self.leases.try_acquire(document_id).ok_or_else(|| {
            warn!(document_id, "ingest rejected, parse already in progress");
            IngestError::InProgress(document_id.to_string())
        })
    }

    /// Ingest `text` for `document` and wait for the result.
    pub async fn ingest(
        &self,
        document: Document,
        text: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let _lease = self.acquire(&document.id)?;
        self.run(document, text).await
    }

    /// Take the lease now and run the pipeline as a background task.
    ///
    /// The rejection for an in-flight document is returned synchronously.
    pub fn spawn(
        &self,
        document: Document,
        text: String,
    ) -> Result<JoinHandle<Result<IngestOutcome, IngestError>>, IngestError> {
        let lease = self.acquire(&document.id)?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let _lease = lease;
            this.run(document, &text).await
        }))
    }

    async fn run(&self, document: Document, text: &str) -> Result<IngestOutcome, IngestError> {
        let doc_id = document.id.clone();
        info!(document_id = %doc_id, class = %document.class, "ingest started");

        self.store.upsert_document(&document).await?;

        match self.pipeline(&document, text).await {
            Ok(chunk_count) => {
                self.store
                    .set_status(&doc_id, &ProcessingStatus::Processed, chunk_count)
                    .await?;
                info!(document_id = %doc_id, chunk_count, "ingest processed");
                Ok(IngestOutcome {
                    chunk_count,
                    status: ProcessingStatus::Processed,
                })
            }
            Err(e) => {
                let status = ProcessingStatus::Failed(e.to_string());
                error!(document_id = %doc_id, error = %e, "ingest failed");
                if let Err(store_err) = self.store.set_status(&doc_id, &status, 0).await {
                    error!(document_id = %doc_id, error = %store_err, "could not record failure");
                }
                Err(e)
            }
        }
    }

    async fn pipeline(&self, document: &Document, text: &str) -> Result<usize, IngestError> {
        let chunks = chunk_text(&document.id, text, &self.params);
        if chunks.is_empty() {
            return Err(IngestError::Empty(document.id.clone()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_all(&document.id, &texts).await?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                chunk_id: chunk.id.clone(),
                vector,
                metadata: ChunkMetadata::from_chunk(document, chunk),
            })
            .collect();

        self.store
            .replace_document_with_chunks(&self.embedder.model(), &document.id, &chunks, &entries)
            .await?;

        Ok(chunks.len())
    }

    /// Remove a document with its chunks and vectors.
    ///
    /// Rejected while an ingestion of the same document is in flight.
    pub async fn delete(&self, document_id: &str) -> Result<usize, IngestError> {
        let _lease = self.acquire(document_id)?;
        let removed = self.store.remove_document(document_id).await?;
        info!(document_id, vectors = removed, "document deleted");
        Ok(removed)
    }
}

/// `chk ingest`: extract a file and ingest it.
pub async fn run_ingest(
    config: &Config,
    id: &str,
    file: &Path,
    class: DocumentClass,
    name: Option<String>,
    knowledgebase_id: Option<String>,
) -> anyhow::Result<()> {
    let text = crate::extract::extract_file(file)
        .with_context(|| format!("Failed to extract text from {}", file.display()))?;
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string())
    });

    let harness = crate::app::Harness::open_without_llm(config).await?;
    let outcome = harness
        .ingestor
        .ingest(Document::new(id, &name, class, knowledgebase_id), &text)
        .await?;

    println!("ingest {}", id);
    println!("  name: {}", name);
    println!("  class: {}", class);
    println!("  chunks: {}", outcome.chunk_count);
    println!("  status: {}", outcome.status.label());
    Ok(())
}

/// `chk delete`: remove a document and its vectors.
pub async fn run_delete(config: &Config, id: &str) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let removed = SqliteStore::new(pool).remove_document(id).await?;
    println!("deleted {} ({} vectors)", id, removed);
    Ok(())
}
