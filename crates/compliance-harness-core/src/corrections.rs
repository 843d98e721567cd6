//! Operator corrections and the scope prompt they fold into.
//!
//! Corrections are recorded unapplied. Applying a scope folds every pending
//! correction, oldest first and verbatim, into a labelled block appended to
//! the scope's active prompt, bumps the prompt version, and marks the
//! corrections applied in one atomic commit. Applying with nothing pending
//! changes nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Correction, ScopePrompt};

/// Heading of the block that holds folded corrections.
pub const CORRECTIONS_HEADER: &str = "KNOWN CORRECTIONS (operator-supplied, follow exactly):";

/// Persistence for corrections and per-scope prompts.
///
/// Implementations must make [`commit_fold`](Self::commit_fold) atomic: the
/// new prompt and the applied flags become visible together or not at all.
#[async_trait]
pub trait CorrectionStore: Send + Sync {
    async fn record(&self, correction: &Correction) -> anyhow::Result<()>;

    /// Unapplied corrections for `scope`, oldest first.
    async fn list_unapplied(&self, scope: &str) -> anyhow::Result<Vec<Correction>>;

    /// All corrections for `scope`, oldest first.
    async fn list(&self, scope: &str) -> anyhow::Result<Vec<Correction>>;

    /// Returns whether a correction was removed.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// The folded prompt for `scope`, if one was ever committed.
    async fn active_prompt(&self, scope: &str) -> anyhow::Result<Option<ScopePrompt>>;

    /// Store `prompt` and mark `applied_ids` applied.
    async fn commit_fold(&self, prompt: &ScopePrompt, applied_ids: &[String])
        -> anyhow::Result<()>;
}

/// Render one correction as it appears inside the block.
fn render(index: usize, c: &Correction) -> String {
    format!(
        "{}. [{}] Query: {}\n   Incorrect response: {}\n   Correction: {}",
        index,
        c.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        c.original_query,
        c.original_response,
        c.correction_text
    )
}

/// Fold `pending` into `current`, returning the next prompt version.
///
/// Output depends only on the inputs: corrections are ordered by creation
/// time, ties broken by id. Already applied corrections are skipped.
/// Returns `None` when there is nothing to fold.
pub fn fold_corrections(
    current: &ScopePrompt,
    pending: &[Correction],
    now: DateTime<Utc>,
) -> Option<ScopePrompt> {
    let mut ordered: Vec<&Correction> = pending.iter().filter(|c| !c.applied).collect();
    if ordered.is_empty() {
        return None;
    }
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut text = current.text.trim_end().to_string();
    if !text.contains(CORRECTIONS_HEADER) {
        text.push_str("\n\n");
        text.push_str(CORRECTIONS_HEADER);
    }
    let offset = current.applied_count as usize;
    for (i, c) in ordered.iter().enumerate() {
        text.push('\n');
        text.push_str(&render(offset + i + 1, c));
    }

    Some(ScopePrompt {
        scope: current.scope.clone(),
        version: current.version + 1,
        text,
        applied_count: current.applied_count + ordered.len() as u64,
        updated_at: now,
    })
}

/// Prompt for a scope that has never been folded.
pub fn initial_prompt(scope: &str, base: &str) -> ScopePrompt {
    ScopePrompt {
        scope: scope.to_string(),
        version: 0,
        text: base.to_string(),
        applied_count: 0,
        updated_at: DateTime::<Utc>::default(),
    }
}
