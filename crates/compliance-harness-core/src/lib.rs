//! # Compliance Harness Core
//!
//! Runtime-agnostic logic for Compliance Harness: data models, chunking,
//! the vector index abstraction, evidence retrieval, the verdict schema
//! and gate, prompt construction, correction folding, and the provider
//! traits for embeddings and language models.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `compliance-harness` app crate supplies SQLite storage, concrete
//! providers, retry execution, and the HTTP/CLI surfaces.

pub mod chunk;
pub mod corrections;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod retry;
pub mod store;
pub mod verdict;
