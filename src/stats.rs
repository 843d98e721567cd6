//! Index statistics and per-document status.
//!
//! `chk stats` prints totals, the embedding model the index is bound to,
//! and one line per document with its processing status. Failed documents
//! show the error text recorded by ingestion.

use anyhow::Result;
use sqlx::Row;

use compliance_harness_core::models::ProcessingStatus;
use compliance_harness_core::store::VectorIndex;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let total_vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;
    let verdict_rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM verdicts GROUP BY status ORDER BY status",
    )
    .fetch_all(&pool)
    .await?;

    let documents = store.list_documents().await?;
    let model = store.indexed_model().await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Compliance Harness — Index Stats");
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Model:       {}",
        model
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unbound".to_string())
    );
    println!();
    println!("  Documents:   {}", documents.len());
    println!("  Chunks:      {}", total_chunks);
    println!("  Vectors:     {}", total_vectors);

    if !verdict_rows.is_empty() {
        println!();
        println!("  Verdicts:");
        for row in &verdict_rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            println!("    {:<26} {:>6}", status, n);
        }
    }

    if !documents.is_empty() {
        println!();
        println!(
            "  {:<28} {:<20} {:>6}   {}",
            "DOCUMENT", "CLASS", "CHUNKS", "STATUS"
        );
        println!("  {}", "-".repeat(76));
        for d in &documents {
            let status = match &d.status {
                ProcessingStatus::Failed(e) => format!("failed: {}", e),
                other => other.label().to_string(),
            };
            println!(
                "  {:<28} {:<20} {:>6}   {}",
                truncate(&d.name, 28),
                d.class.as_str(),
                d.chunk_count,
                status
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
