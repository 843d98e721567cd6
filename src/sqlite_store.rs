//! SQLite persistence.
//!
//! [`SqliteStore`] implements the core [`VectorIndex`] and
//! [`CorrectionStore`] traits plus the engine's [`VerdictSink`], and
//! carries the document status and chunk bookkeeping used by ingestion.
//!
//! Vectors live in `chunk_vectors` next to the metadata a search returns.
//! Every multi-row write runs in one transaction, so readers see either
//! the old or the new state of a document.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use compliance_harness_core::corrections::CorrectionStore;
use compliance_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use compliance_harness_core::error::IndexError;
use compliance_harness_core::models::{
    Chunk, Correction, Document, DocumentClass, EmbeddingModel, ProcessingStatus, ScopePrompt,
};
use compliance_harness_core::store::{
    check_model, rank, ChunkMetadata, IndexEntry, ScopeFilter, ScoredChunk, VectorIndex,
};

use crate::engine::{VerdictRecord, VerdictSink};

const META_MODEL: &str = "model_name";
const META_DIMS: &str = "model_dims";

/// SQLite implementation of the storage traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend(e: impl std::fmt::Display) -> IndexError {
    IndexError::Backend(e.to_string())
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

async fn read_model<'e, E>(executor: E) -> Result<Option<EmbeddingModel>, IndexError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT key, value FROM index_meta WHERE key IN (?, ?)")
        .bind(META_MODEL)
        .bind(META_DIMS)
        .fetch_all(executor)
        .await
        .map_err(backend)?;

    let mut name = None;
    let mut dims = None;
    for row in rows {
        let key: String = row.get("key");
        let value: String = row.get("value");
        match key.as_str() {
            META_MODEL => name = Some(value),
            META_DIMS => dims = Some(value.parse::<usize>().map_err(backend)?),
            _ => {}
        }
    }
    Ok(match (name, dims) {
        (Some(n), Some(d)) => Some(EmbeddingModel::new(n, d)),
        _ => None,
    })
}

/// Check `model` against the stored binding, binding it when the index is fresh.
async fn bind_model(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &EmbeddingModel,
    vector_len: usize,
) -> Result<(), IndexError> {
    let indexed = read_model(&mut **tx).await?;
    check_model(indexed.as_ref(), model, vector_len)?;
    if indexed.is_none() {
        for (key, value) in [
            (META_MODEL, model.name.clone()),
            (META_DIMS, model.dims.to_string()),
        ] {
            sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await
                .map_err(backend)?;
        }
    }
    Ok(())
}

async fn write_vectors(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &EmbeddingModel,
    document_id: &str,
    entries: &[IndexEntry],
) -> Result<(), IndexError> {
    for e in entries {
        bind_model(tx, model, e.vector.len()).await?;
    }

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;

    for e in entries {
        insert_vector(tx, model, e).await?;
    }
    Ok(())
}

async fn insert_vector(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &EmbeddingModel,
    entry: &IndexEntry,
) -> Result<(), IndexError> {
    let m = &entry.metadata;
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, document_name,
                                   document_class, knowledgebase_id, section_label,
                                   clause_number, page_number, text, model, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            chunk_index = excluded.chunk_index,
            document_name = excluded.document_name,
            document_class = excluded.document_class,
            knowledgebase_id = excluded.knowledgebase_id,
            section_label = excluded.section_label,
            clause_number = excluded.clause_number,
            page_number = excluded.page_number,
            text = excluded.text,
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&entry.chunk_id)
    .bind(&m.document_id)
    .bind(m.chunk_index)
    .bind(&m.document_name)
    .bind(m.document_class.as_str())
    .bind(&m.knowledgebase_id)
    .bind(&m.section_label)
    .bind(&m.clause_number)
    .bind(m.page_number.map(i64::from))
    .bind(&m.text)
    .bind(&model.name)
    .bind(model.dims as i64)
    .bind(vec_to_blob(&entry.vector))
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn indexed_model(&self) -> Result<Option<EmbeddingModel>, IndexError> {
        read_model(&self.pool).await
    }

    async fn upsert(&self, model: &EmbeddingModel, entry: IndexEntry) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        bind_model(&mut tx, model, entry.vector.len()).await?;
        insert_vector(&mut tx, model, &entry).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn replace_document(
        &self,
        model: &EmbeddingModel,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        write_vectors(&mut tx, model, document_id, &entries).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, IndexError> {
        let res = sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let res = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(res.rows_affected() as usize)
    }

    async fn search(
        &self,
        model: &EmbeddingModel,
        query: &[f32],
        k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let indexed = read_model(&self.pool).await?;
        check_model(indexed.as_ref(), model, query.len())?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, chunk_index, document_name, document_class, \
             knowledgebase_id, section_label, clause_number, page_number, text, embedding \
             FROM chunk_vectors WHERE model = ",
        );
        qb.push_bind(model.name.clone());

        // Scope restriction happens in SQL, before any scoring
        if let Some(ids) = &filter.document_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND document_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(kb) = &filter.knowledgebase_id {
            qb.push(" AND knowledgebase_id = ");
            qb.push_bind(kb.clone());
        }
        if let Some(classes) = &filter.classes {
            if classes.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND document_class IN (");
            let mut sep = qb.separated(", ");
            for c in classes {
                sep.push_bind(c.as_str());
            }
            sep.push_unseparated(")");
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let class: String = row.get("document_class");
            let page: Option<i64> = row.get("page_number");
            let vector = blob_to_vec(&blob);
            hits.push(ScoredChunk {
                chunk_id: row.get("chunk_id"),
                score: cosine_similarity(query, &vector) as f64,
                metadata: ChunkMetadata {
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    section_label: row.get("section_label"),
                    clause_number: row.get("clause_number"),
                    page_number: page.and_then(|p| u32::try_from(p).ok()),
                    document_name: row.get("document_name"),
                    document_class: class.parse::<DocumentClass>().map_err(backend)?,
                    knowledgebase_id: row.get("knowledgebase_id"),
                    text: row.get("text"),
                },
            });
        }

        rank(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

// ============ Documents ============

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let class: String = row.get("class");
    let status: String = row.get("status");
    let chunk_count: i64 = row.get("chunk_count");
    Ok(Document {
        id: row.get("id"),
        name: row.get("name"),
        class: class.parse::<DocumentClass>().map_err(|e| anyhow::anyhow!(e))?,
        knowledgebase_id: row.get("knowledgebase_id"),
        status: ProcessingStatus::from_parts(&status, row.get("error")),
        chunk_count: chunk_count.max(0) as usize,
    })
}

impl SqliteStore {
    /// Insert a document or refresh its name, class, and knowledgebase.
    pub async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, class, knowledgebase_id, status, error, chunk_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                class = excluded.class,
                knowledgebase_id = excluded.knowledgebase_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.name)
        .bind(doc.class.as_str())
        .bind(&doc.knowledgebase_id)
        .bind(doc.status.label())
        .bind(doc.status.error())
        .bind(doc.chunk_count as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, name, class, knowledgebase_id, status, error, chunk_count FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, name, class, knowledgebase_id, status, error, chunk_count FROM documents ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: &ProcessingStatus,
        chunk_count: usize,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?, error = ?, chunk_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.label())
        .bind(status.error())
        .bind(chunk_count as i64)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the stored chunk list of a document.
    /// Replace a document's chunk rows and vectors in one transaction.
    ///
    /// A rejected vector write (model or dimension mismatch) leaves both
    /// tables as they were.
    pub async fn replace_document_with_chunks(
        &self,
        model: &EmbeddingModel,
        doc_id: &str,
        chunks: &[Chunk],
        entries: &[IndexEntry],
    ) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        write_vectors(&mut tx, model, doc_id, entries).await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, section_label,
                                    clause_number, page_number, token_count, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.section_label)
            .bind(&chunk.clause_number)
            .bind(chunk.page_number.map(i64::from))
            .bind(chunk.token_count as i64)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    pub async fn chunk_count(&self, doc_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// Delete a document, its chunks, and its vectors in one transaction.
    /// Returns the number of vectors removed.
    pub async fn remove_document(&self, id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let vectors = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(vectors as usize)
    }
}

// ============ Corrections ============

fn row_to_correction(row: &sqlx::sqlite::SqliteRow) -> Correction {
    let applied: i64 = row.get("applied");
    let created_at: i64 = row.get("created_at");
    Correction {
        id: row.get("id"),
        scope: row.get("scope"),
        original_query: row.get("original_query"),
        original_response: row.get("original_response"),
        correction_text: row.get("correction_text"),
        applied: applied != 0,
        created_at: from_micros(created_at),
    }
}

#[async_trait]
impl CorrectionStore for SqliteStore {
    async fn record(&self, c: &Correction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO corrections (id, scope, original_query, original_response,
                                     correction_text, applied, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.scope)
        .bind(&c.original_query)
        .bind(&c.original_response)
        .bind(&c.correction_text)
        .bind(c.applied as i64)
        .bind(to_micros(c.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unapplied(&self, scope: &str) -> Result<Vec<Correction>> {
        let rows = sqlx::query(
            "SELECT * FROM corrections WHERE scope = ? AND applied = 0 ORDER BY created_at, id",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_correction).collect())
    }

    async fn list(&self, scope: &str) -> Result<Vec<Correction>> {
        let rows = sqlx::query("SELECT * FROM corrections WHERE scope = ? ORDER BY created_at, id")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_correction).collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM corrections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn active_prompt(&self, scope: &str) -> Result<Option<ScopePrompt>> {
        let row = sqlx::query(
            "SELECT scope, version, text, applied_count, updated_at FROM scope_prompts WHERE scope = ?",
        )
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let version: i64 = r.get("version");
            let applied_count: i64 = r.get("applied_count");
            let updated_at: i64 = r.get("updated_at");
            ScopePrompt {
                scope: r.get("scope"),
                version: version.max(0) as u64,
                text: r.get("text"),
                applied_count: applied_count.max(0) as u64,
                updated_at: from_micros(updated_at),
            }
        }))
    }

    async fn commit_fold(&self, prompt: &ScopePrompt, applied_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Version must advance by exactly one from what is stored
        let res = sqlx::query(
            r#"
            INSERT INTO scope_prompts (scope, version, text, applied_count, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(scope) DO UPDATE SET
                version = excluded.version,
                text = excluded.text,
                applied_count = excluded.applied_count,
                updated_at = excluded.updated_at
            WHERE scope_prompts.version = excluded.version - 1
            "#,
        )
        .bind(&prompt.scope)
        .bind(prompt.version as i64)
        .bind(&prompt.text)
        .bind(prompt.applied_count as i64)
        .bind(to_micros(prompt.updated_at))
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() != 1 {
            bail!(
                "scope '{}' prompt changed concurrently; expected to write version {}",
                prompt.scope,
                prompt.version
            );
        }

        for id in applied_ids {
            sqlx::query("UPDATE corrections SET applied = 1 WHERE id = ? AND scope = ?")
                .bind(id)
                .bind(&prompt.scope)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ============ Audit ============

#[async_trait]
impl VerdictSink for SqliteStore {
    async fn persist(&self, record: &VerdictRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verdicts (id, scope, query, status, confidence, verdict_json, model,
                                  evidence_json, processing_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.query_id)
        .bind(&record.scope)
        .bind(&record.query)
        .bind(record.verdict.status.as_str())
        .bind(record.verdict.confidence_score)
        .bind(serde_json::to_string(&record.verdict)?)
        .bind(&record.model)
        .bind(serde_json::to_string(&record.evidence_chunk_ids)?)
        .bind(record.processing_ms as i64)
        .bind(to_micros(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_roundtrip_keeps_precision() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(from_micros(to_micros(ts)), ts);
    }
}
