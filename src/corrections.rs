//! The Correction Loop service.
//!
//! Applies hold a per-scope exclusive lock for the whole
//! read → fold → commit sequence, so two applies on the same scope never
//! interleave. Different scopes apply independently. A scope's lock is
//! dropped from the map once no apply holds it. The store's commit is also
//! version-checked, which catches a writer in another process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use uuid::Uuid;

use compliance_harness_core::corrections::{fold_corrections, initial_prompt, CorrectionStore};
use compliance_harness_core::models::{Correction, ScopePrompt};
use compliance_harness_core::prompt::BASE_SYSTEM_PROMPT;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Operator input for a new correction.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewCorrection {
    pub scope: String,
    pub original_query: String,
    pub original_response: String,
    pub correction_text: String,
}

#[derive(Clone)]
pub struct CorrectionService {
    store: Arc<dyn CorrectionStore>,
    scope_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl CorrectionService {
    pub fn new(store: Arc<dyn CorrectionStore>) -> Self {
        Self {
            store,
            scope_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn scope_lock(&self, scope: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.scope_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Store an unapplied correction.
    pub async fn record(&self, input: NewCorrection) -> Result<Correction, CorrectionError> {
        for (name, value) in [
            ("scope", &input.scope),
            ("original_query", &input.original_query),
            ("correction_text", &input.correction_text),
        ] {
            if value.trim().is_empty() {
                return Err(CorrectionError::EmptyField(name));
            }
        }

        let correction = Correction {
            id: Uuid::new_v4().to_string(),
            scope: input.scope,
            original_query: input.original_query,
            original_response: input.original_response,
            correction_text: input.correction_text,
            applied: false,
            created_at: Utc::now(),
        };
        self.store.record(&correction).await?;
        info!(scope = %correction.scope, correction_id = %correction.id, "correction recorded");
        Ok(correction)
    }

    /// Drop the map entry for `scope` when no apply still holds its lock.
    fn prune_scope_lock(&self, scope: &str) {
        let mut locks = self.scope_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(scope).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(scope);
        }
    }

    /// Fold every pending correction for `scope` into its prompt.
    ///
    /// Returns how many were applied; zero pending is a no-op.
    pub async fn apply(&self, scope: &str) -> Result<usize, CorrectionError> {
        let lock = self.scope_lock(scope);
        let result = {
            let _guard = lock.lock().await;
            self.fold_pending(scope).await
        };
        drop(lock);
        self.prune_scope_lock(scope);
        result
    }

    async fn fold_pending(&self, scope: &str) -> Result<usize, CorrectionError> {
        let pending = self.store.list_unapplied(scope).await?;
        let current = self.active_prompt(scope).await?;

        let Some(next) = fold_corrections(&current, &pending, Utc::now()) else {
            info!(scope, "no pending corrections");
            return Ok(0);
        };

        let ids: Vec<String> = pending
            .iter()
            .filter(|c| !c.applied)
            .map(|c| c.id.clone())
            .collect();
        self.store.commit_fold(&next, &ids).await?;

        info!(
            scope,
            applied = ids.len(),
            version = next.version,
            "corrections folded into prompt"
        );
        Ok(ids.len())
    }

    /// The prompt the next decision for `scope` will use.
    pub async fn active_prompt(&self, scope: &str) -> Result<ScopePrompt, CorrectionError> {
        Ok(self
            .store
            .active_prompt(scope)
            .await?
            .unwrap_or_else(|| initial_prompt(scope, BASE_SYSTEM_PROMPT)))
    }

    pub async fn list(&self, scope: &str) -> Result<Vec<Correction>, CorrectionError> {
        Ok(self.store.list(scope).await?)
    }

    /// Delete a correction. Text already folded into a prompt stays there.
    pub async fn delete(&self, id: &str) -> Result<bool, CorrectionError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(correction_id = id, "correction deleted");
        }
        Ok(removed)
    }
}

/// Correction service over the configured database. Needs no providers.
async fn open_service(config: &Config) -> anyhow::Result<CorrectionService> {
    let pool = db::connect(config).await?;
    Ok(CorrectionService::new(Arc::new(SqliteStore::new(pool))))
}

/// `chk correct record`
pub async fn run_record(config: &Config, input: NewCorrection) -> anyhow::Result<()> {
    let service = open_service(config).await?;
    let c = service.record(input).await?;
    println!("recorded correction {} (scope: {}, unapplied)", c.id, c.scope);
    Ok(())
}

/// `chk correct apply`
pub async fn run_apply(config: &Config, scope: &str) -> anyhow::Result<()> {
    let service = open_service(config).await?;
    let applied = service.apply(scope).await?;
    let prompt = service.active_prompt(scope).await?;
    println!(
        "applied {} correction(s) to scope {} (prompt v{})",
        applied, scope, prompt.version
    );
    Ok(())
}

/// `chk correct list`
pub async fn run_list(config: &Config, scope: &str) -> anyhow::Result<()> {
    let service = open_service(config).await?;
    let corrections = service.list(scope).await?;
    if corrections.is_empty() {
        println!("No corrections for scope {}.", scope);
        return Ok(());
    }
    for c in &corrections {
        println!(
            "{}  {}  [{}]  {}",
            c.id,
            c.created_at.format("%Y-%m-%d %H:%M"),
            if c.applied { "applied" } else { "pending" },
            c.original_query
        );
        println!("    -> {}", c.correction_text);
    }
    Ok(())
}

/// `chk correct delete`
pub async fn run_delete(config: &Config, id: &str) -> anyhow::Result<()> {
    let service = open_service(config).await?;
    if service.delete(id).await? {
        println!("deleted correction {}", id);
    } else {
        anyhow::bail!("no correction with id: {}", id);
    }
    Ok(())
}
