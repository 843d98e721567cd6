//! # Compliance Harness
//!
//! A retrieval-and-compliance-decision engine. Documents are chunked,
//! embedded, and indexed; questions are answered with a structured,
//! citation-backed compliance verdict instead of free text.
//!
//! ## Architecture
//!
//! ```text
//! document ─▶ Chunker ─▶ Embedder ─▶ Vector Index (SQLite)
//!                                        │
//! query ─▶ Embedder ─▶ Retriever ◀───────┘
//!                         │ evidence
//!                         ▼
//!              Decision Engine ◀── scope prompt ◀── Correction Loop
//!                         │
//!                         ▼
//!                 ComplianceVerdict
//! ```
//!
//! Pure logic (chunking, ranking, verdict validation, correction folding)
//! lives in `compliance-harness-core`. This crate adds the async runtime,
//! SQLite storage, HTTP providers, the `chk` CLI, and the HTTP API.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | Database connection and schema |
//! | [`sqlite_store`] | Vector index, corrections, documents, audit |
//! | [`embedding`] | Embedding providers |
//! | [`embed`] | Batching and item-level retry |
//! | [`llm`] | LLM providers |
//! | [`retry`] | Backoff executor |
//! | [`ingest`] | Ingestion pipeline with per-document leases |
//! | [`retriever`] | Query embedding and evidence assembly |
//! | [`engine`] | Compliance Decision Engine |
//! | [`corrections`] | Correction Loop |
//! | [`server`] | HTTP API |

pub mod app;
pub mod config;
pub mod corrections;
pub mod db;
pub mod embed;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod retriever;
pub mod retry;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
