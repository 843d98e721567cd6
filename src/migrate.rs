use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Documents handed over by the document store, with pipeline status
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            knowledgebase_id TEXT,
            status TEXT NOT NULL DEFAULT 'unparsed',
            error TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ordered chunks per document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            section_label TEXT,
            clause_number TEXT,
            page_number INTEGER,
            token_count INTEGER NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector index: one row per chunk with the metadata search returns
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            document_name TEXT NOT NULL,
            document_class TEXT NOT NULL,
            knowledgebase_id TEXT,
            section_label TEXT,
            clause_number TEXT,
            page_number INTEGER,
            text TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Model binding of the vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corrections (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            original_query TEXT NOT NULL,
            original_response TEXT NOT NULL,
            correction_text TEXT NOT NULL,
            applied INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scope_prompts (
            scope TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            text TEXT NOT NULL,
            applied_count INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Write-only audit trail, one row per completed query
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verdicts (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            query TEXT NOT NULL,
            status TEXT NOT NULL,
            confidence REAL NOT NULL,
            verdict_json TEXT NOT NULL,
            model TEXT NOT NULL,
            evidence_json TEXT NOT NULL,
            processing_ms INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_kb ON chunk_vectors(knowledgebase_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_corrections_scope ON corrections(scope, applied, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
