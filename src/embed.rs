//! The Embedder: batching and item-level retry over an [`EmbeddingProvider`].
//!
//! Texts are sent in batches of at most `min(batch_size, provider.max_batch())`.
//! When a call returns a mix of vectors and errors, only the failed items are
//! sent again, up to the policy's attempt budget with exponential backoff.
//! If any item still has no vector when the budget runs out the whole
//! request fails; a partial set of vectors is never returned.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use compliance_harness_core::embedding::EmbeddingProvider;
use compliance_harness_core::error::ProviderError;
use compliance_harness_core::models::EmbeddingModel;
use compliance_harness_core::retry::RetryPolicy;

use crate::retry::jitter_sample;

#[derive(Error, Debug)]
pub enum EmbedError {
    /// An item could not be embedded within the retry budget.
    #[error("embedding failed for item {index} after {attempts} attempts: {source}")]
    Exhausted {
        index: usize,
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    /// A non-retryable provider error.
    #[error("embedding rejected for item {index}: {source}")]
    Rejected {
        index: usize,
        #[source]
        source: ProviderError,
    },
}

impl EmbedError {
    pub fn provider_error(&self) -> &ProviderError {
        match self {
            EmbedError::Exhausted { source, .. } | EmbedError::Rejected { source, .. } => source,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Exhausted { .. }) && self.provider_error().is_transient()
    }
}

/// Batches texts to a provider and retries failed items.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy, batch_size: usize) -> Self {
        Self {
            provider,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    /// Model identity of every vector this embedder returns.
    pub fn model(&self) -> EmbeddingModel {
        self.provider.model()
    }

    fn effective_batch(&self) -> usize {
        self.batch_size.min(self.provider.max_batch()).max(1)
    }

    /// Embed `texts`, returning vectors in input order.
    ///
    /// `subject` (a document id or query id) is carried into every log line.
    pub async fn embed_all(
        &self,
        subject: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let batch = self.effective_batch();

        for start in (0..texts.len()).step_by(batch) {
            let end = (start + batch).min(texts.len());
            self.embed_window(subject, texts, start..end, &mut out)
                .await?;
        }

        // Every slot is filled once all windows succeed
        Ok(out.into_iter().flatten().collect())
    }

    /// Embed one batch window, resending only the failed positions.
    async fn embed_window(
        &self,
        subject: &str,
        texts: &[String],
        window: std::ops::Range<usize>,
        out: &mut [Option<Vec<f32>>],
    ) -> Result<(), EmbedError> {
        let attempts = self.policy.attempts();
        let mut pending: Vec<usize> = window.collect();
        let mut attempt = 1;

        loop {
            let inputs: Vec<String> = pending.iter().map(|&i| texts[i].clone()).collect();
            let results = match tokio::time::timeout(
                self.policy.timeout,
                self.provider.embed_batch(&inputs),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    let e = ProviderError::Timeout(self.policy.timeout.as_millis() as u64);
                    vec![Err(e); inputs.len()]
                }
            };

            let mut failed: Vec<(usize, ProviderError)> = Vec::new();
            for (pos, &index) in pending.iter().enumerate() {
                match results.get(pos).cloned() {
                    Some(Ok(v)) => out[index] = Some(v),
                    Some(Err(e)) => failed.push((index, e)),
                    None => failed.push((
                        index,
                        ProviderError::Transient("provider returned too few results".into()),
                    )),
                }
            }

            if failed.is_empty() {
                debug!(subject, attempt, items = pending.len(), "embedded batch");
                return Ok(());
            }

            if let Some((index, e)) = failed.iter().find(|(_, e)| !e.is_transient()) {
                warn!(subject, attempt, index, error = %e, "embedding rejected");
                return Err(EmbedError::Rejected {
                    index: *index,
                    source: e.clone(),
                });
            }

            if attempt >= attempts {
                let (index, e) = failed.swap_remove(0);
                warn!(
                    subject,
                    attempt,
                    failed = failed.len() + 1,
                    error = %e,
                    "embedding retries exhausted"
                );
                return Err(EmbedError::Exhausted {
                    index,
                    attempts: attempt,
                    source: e,
                });
            }

            let delay = self.policy.delay_for(attempt, jitter_sample());
            warn!(
                subject,
                attempt,
                max_attempts = attempts,
                failed = failed.len(),
                delay_ms = delay.as_millis() as u64,
                error = %failed[0].1,
                "embedding batch partially failed, retrying failed items"
            );
            tokio::time::sleep(delay).await;

            pending = failed.into_iter().map(|(i, _)| i).collect();
            attempt += 1;
        }
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, query_id: &str, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.embed_all(query_id, &[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| EmbedError::Exhausted {
            index: 0,
            attempts: 0,
            source: ProviderError::Permanent("no vector returned for query".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails each text a configured number of times before succeeding.
    struct Flaky {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<usize>>,
        permanent: bool,
    }

    impl Flaky {
        fn new(plan: &[(&str, u32)], permanent: bool) -> Self {
            Self {
                failures: Mutex::new(plan.iter().map(|(t, n)| (t.to_string(), *n)).collect()),
                calls: Mutex::new(Vec::new()),
                permanent,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_batch(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, ProviderError>> {
            self.calls.lock().unwrap().push(texts.len());
            let mut failures = self.failures.lock().unwrap();
            texts
                .iter()
                .map(|t| match failures.get_mut(t) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        if self.permanent {
                            Err(ProviderError::Permanent("bad input".into()))
                        } else {
                            Err(ProviderError::Transient("rate limited".into()))
                        }
                    }
                    _ => Ok(vec![t.len() as f32, 1.0]),
                })
                .collect()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batches_by_provider_limit() {
        let provider = Arc::new(Flaky::new(&[], false));
        let embedder = Embedder::new(provider.clone(), RetryPolicy::immediate(3), 64);
        let out = embedder
            .embed_all("doc", &texts(&["a", "bb", "ccc", "dddd", "e"]))
            .await
            .unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[3], vec![4.0, 1.0]);
        assert_eq!(*provider.calls.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_retries_only_failed_items() {
        let provider = Arc::new(Flaky::new(&[("bb", 1)], false));
        let embedder = Embedder::new(provider.clone(), RetryPolicy::immediate(3), 2);
        let out = embedder.embed_all("doc", &texts(&["a", "bb"])).await.unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![2.0, 1.0]]);
        assert_eq!(*provider.calls.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_whole_request() {
        let provider = Arc::new(Flaky::new(&[("a", 10)], false));
        let embedder = Embedder::new(provider, RetryPolicy::immediate(3), 2);
        let err = embedder
            .embed_all("doc", &texts(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::Exhausted { index: 0, attempts: 3, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let provider = Arc::new(Flaky::new(&[("a", 1)], true));
        let embedder = Embedder::new(provider.clone(), RetryPolicy::immediate(3), 2);
        let err = embedder.embed_all("doc", &texts(&["a"])).await.unwrap_err();
        assert!(matches!(err, EmbedError::Rejected { .. }));
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_embed_query() {
        let embedder = Embedder::new(Arc::new(Flaky::new(&[], false)), RetryPolicy::immediate(1), 8);
        let v = embedder.embed_query("q1", "abc").await.unwrap();
        assert_eq!(v, vec![3.0, 1.0]);
        assert_eq!(embedder.model(), EmbeddingModel::new("flaky", 2));
    }
}
