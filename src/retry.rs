//! Async execution of a [`RetryPolicy`].
//!
//! Every external call (embedding batch, LLM generation) goes through
//! [`with_retry`]: each attempt is bounded by the policy timeout, transient
//! failures and timeouts back off and retry, permanent failures return at
//! once. Each retry is logged with the operation, subject id, and attempt.

use std::future::Future;

use tracing::warn;
use uuid::Uuid;

use compliance_harness_core::error::ProviderError;
use compliance_harness_core::retry::RetryPolicy;

/// Uniform sample in `[0, 1)` for backoff jitter.
pub fn jitter_sample() -> f64 {
    const BITS: u32 = 53;
    // Low 53 bits of a v4 UUID are fully random
    let raw = (Uuid::new_v4().as_u128() as u64) & ((1u64 << BITS) - 1);
    raw as f64 / (1u64 << BITS) as f64
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-based attempt number. `operation` and `subject`
/// (a document id or query id) only feed the logs.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    subject: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(r) => r,
            Err(_) => Err(ProviderError::Timeout(policy.timeout.as_millis() as u64)),
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.delay_for(attempt, jitter_sample());
                warn!(
                    operation,
                    subject,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    operation,
                    subject,
                    attempt,
                    transient = e.is_transient(),
                    error = %e,
                    "giving up"
                );
                return Err(e);
            }
        }
    }
}
