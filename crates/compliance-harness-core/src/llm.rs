//! Chat-completion provider trait used by the decision engine.
//!
//! Concrete providers (OpenAI-compatible, Gemini) live in the app crate.

use async_trait::async_trait;

use crate::error::ProviderError;

/// A text-in, text-out language model.
///
/// One call to [`generate`](Self::generate) is one external request; retry
/// and timeout policy are applied by the caller.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError>;
}
