//! The Compliance Decision Engine.
//!
//! One request moves through a fixed sequence:
//!
//! 1. **Retrieve** — embed the query and assemble evidence. No evidence means
//!    an `INSUFFICIENT_INFORMATION` verdict without calling the model.
//! 2. **Compose** — the scope's active prompt is the system message; the user
//!    message carries the query, evidence, optional document, history, and
//!    the retrieval confidence.
//! 3. **Invoke** — one generation under the LLM [`RetryPolicy`].
//! 4. **Parse** — strict schema validation. A violation gets exactly one
//!    repair attempt with a corrective instruction appended.
//! 5. **Gate / Attach** — citation and confidence guardrails from
//!    [`compliance_harness_core::verdict::finalize`]. Weak retrieval caps the
//!    model's confidence.
//!
//! The work runs on its own task. If the caller goes away before it ends,
//! the in-flight calls finish but the verdict is neither returned nor
//! written to the audit sink.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use compliance_harness_core::corrections::{initial_prompt, CorrectionStore};
use compliance_harness_core::error::{ProviderError, SchemaViolation};
use compliance_harness_core::llm::LlmProvider;
use compliance_harness_core::models::EvidenceItem;
use compliance_harness_core::prompt::{
    compose_request, repair_instruction, ConversationTurn, BASE_SYSTEM_PROMPT,
};
use compliance_harness_core::retrieve::retrieval_confidence;
use compliance_harness_core::retry::RetryPolicy;
use compliance_harness_core::store::ScopeFilter;
use compliance_harness_core::verdict::{
    finalize, insufficient_verdict, parse_model_output, ComplianceVerdict, ModelVerdict,
};

use crate::retriever::{RetrieveError, Retriever};
use crate::retry::with_retry;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A provider stayed unavailable for the whole retry budget.
    #[error("provider unavailable after retries: {0}")]
    Transient(ProviderError),
    /// A provider refused the request (auth, bad request).
    #[error("provider rejected request: {0}")]
    Provider(ProviderError),
    /// Model output failed validation twice.
    #[error(transparent)]
    Schema(#[from] SchemaViolation),
    /// Embedding model of the query does not match the index.
    #[error("configuration mismatch: {0}")]
    Configuration(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("prompt store error: {0}")]
    Store(String),
    #[error("request cancelled")]
    Cancelled,
}

impl EngineError {
    fn from_provider(e: ProviderError) -> Self {
        if e.is_transient() {
            EngineError::Transient(e)
        } else {
            EngineError::Provider(e)
        }
    }

    /// Text safe to show an end user. Never contains provider output.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::Transient(_) | EngineError::Index(_) | EngineError::Store(_) => {
                "The compliance service is temporarily unavailable. Please try again shortly."
            }
            EngineError::Schema(_) => {
                "The compliance analysis could not be completed. Please try again."
            }
            EngineError::Provider(_) | EngineError::Configuration(_) => {
                "The compliance service is not available right now. Please try again later \
                 or contact an administrator."
            }
            EngineError::Cancelled => "The request was cancelled.",
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_)
                | EngineError::Schema(_)
                | EngineError::Index(_)
                | EngineError::Store(_)
        )
    }
}

impl From<RetrieveError> for EngineError {
    fn from(e: RetrieveError) -> Self {
        match e {
            RetrieveError::Embedding(e) => EngineError::from_provider(e.provider_error().clone()),
            RetrieveError::Index(e) if e.is_configuration() => {
                EngineError::Configuration(e.to_string())
            }
            RetrieveError::Index(e) => EngineError::Index(e.to_string()),
            RetrieveError::Timeout(ms) => EngineError::Transient(ProviderError::Timeout(ms)),
        }
    }
}

/// Immutable audit record emitted once per completed query.
#[derive(Debug, Clone, Serialize)]
pub struct VerdictRecord {
    pub query_id: String,
    pub scope: String,
    pub query: String,
    pub verdict: ComplianceVerdict,
    pub model: String,
    pub evidence_chunk_ids: Vec<String>,
    pub processing_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Write-only destination for verdict records.
#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn persist(&self, record: &VerdictRecord) -> anyhow::Result<()>;
}

/// One compliance question.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssessRequest {
    pub query: String,
    /// Prompt scope; `[decision].default_scope` when absent.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub filter: ScopeFilter,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// User document to check against the corpus.
    #[serde(default)]
    pub document_content: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

impl AssessRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// The verdict plus the context it was produced in.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub query_id: String,
    pub scope: String,
    pub prompt_version: u64,
    pub verdict: ComplianceVerdict,
    pub evidence: Vec<EvidenceItem>,
}

/// Turns a query into a gated [`ComplianceVerdict`].
#[derive(Clone)]
pub struct DecisionEngine {
    retriever: Retriever,
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<dyn CorrectionStore>,
    sink: Arc<dyn VerdictSink>,
    policy: RetryPolicy,
    confidence_threshold: f64,
    default_scope: String,
}

impl DecisionEngine {
    pub fn new(
        retriever: Retriever,
        llm: Arc<dyn LlmProvider>,
        prompts: Arc<dyn CorrectionStore>,
        sink: Arc<dyn VerdictSink>,
        policy: RetryPolicy,
        confidence_threshold: f64,
        default_scope: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            llm,
            prompts,
            sink,
            policy,
            confidence_threshold,
            default_scope: default_scope.into(),
        }
    }

    pub fn default_scope(&self) -> &str {
        &self.default_scope
    }

    /// Answer `request`. Safe to call concurrently.
    pub async fn assess(&self, request: AssessRequest) -> Result<Assessment, EngineError> {
        let this = self.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let started = Instant::now();
            let query_id = Uuid::new_v4().to_string();
            let result = this.decide(&query_id, &request).await;

            let record = result.as_ref().ok().map(|a| VerdictRecord {
                query_id: a.query_id.clone(),
                scope: a.scope.clone(),
                query: request.query.clone(),
                verdict: a.verdict.clone(),
                model: this.llm.model_name().to_string(),
                evidence_chunk_ids: a.evidence.iter().map(|e| e.chunk_id.clone()).collect(),
                processing_ms: started.elapsed().as_millis() as u64,
                created_at: Utc::now(),
            });

            if tx.send(result).is_err() {
                info!(query_id = %query_id, "caller went away, verdict discarded");
                return;
            }
            if let Some(record) = record {
                if let Err(e) = this.sink.persist(&record).await {
                    error!(query_id = %query_id, error = %e, "failed to persist verdict record");
                }
            }
        });

        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    async fn decide(
        &self,
        query_id: &str,
        request: &AssessRequest,
    ) -> Result<Assessment, EngineError> {
        let scope = request
            .scope
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.default_scope.clone());

        let evidence = self
            .retriever
            .retrieve(
                query_id,
                &request.query,
                request.top_k,
                request.filter.clone(),
            )
            .await
            .map_err(|e| {
                warn!(query_id, error = %e, "retrieval failed");
                EngineError::from(e)
            })?;

        let prompt = match self
            .prompts
            .active_prompt(&scope)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            Some(p) => p,
            None => initial_prompt(&scope, BASE_SYSTEM_PROMPT),
        };

        if evidence.is_empty() {
            info!(query_id, scope = %scope, "no evidence above threshold, skipping model call");
            return Ok(Assessment {
                query_id: query_id.to_string(),
                scope,
                prompt_version: prompt.version,
                verdict: insufficient_verdict(),
                evidence,
            });
        }

        let top_k = request.top_k.unwrap_or(self.retriever.default_top_k());
        let retrieval = retrieval_confidence(&evidence, top_k);
        debug!(query_id, retrieval_confidence = retrieval, "evidence scored");

        let user = compose_request(
            &request.query,
            &evidence,
            request.document_content.as_deref(),
            &request.history,
            retrieval,
        );

        let model = self.generate_verdict(query_id, &prompt.text, &user).await?;
        let claimed = model.status;
        let (verdict, report) =
            finalize(model, &evidence, self.confidence_threshold, retrieval);

        if let Some(model_confidence) = report.capped_from {
            info!(
                query_id,
                model_confidence,
                retrieval_confidence = retrieval,
                "confidence capped by retrieval"
            );
        }

        if report.dropped_points > 0 || report.dropped_violations > 0 {
            warn!(
                query_id,
                dropped_points = report.dropped_points,
                dropped_violations = report.dropped_violations,
                "gate removed uncited claims"
            );
        }
        if let Some(reason) = report.downgrade {
            info!(
                query_id,
                claimed = %claimed,
                confidence = verdict.confidence_score,
                reason = ?reason,
                "verdict downgraded to INSUFFICIENT_INFORMATION"
            );
        }
        info!(
            query_id,
            scope = %scope,
            status = %verdict.status,
            confidence = verdict.confidence_score,
            sources = verdict.source_documents.len(),
            "verdict ready"
        );

        Ok(Assessment {
            query_id: query_id.to_string(),
            scope,
            prompt_version: prompt.version,
            verdict,
            evidence,
        })
    }

    /// Invoke and parse, with a single repair attempt on schema violation.
    async fn generate_verdict(
        &self,
        query_id: &str,
        system: &str,
        user: &str,
    ) -> Result<ModelVerdict, EngineError> {
        let raw = self.invoke(query_id, system, user).await?;
        let err = match parse_model_output(&raw) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        warn!(query_id, error = %err, "model output failed validation, repairing");
        let repair = format!("{}\n\n{}", user, repair_instruction(&raw, &err));
        let raw = self.invoke(query_id, system, &repair).await?;
        parse_model_output(&raw).map_err(|e| {
            error!(query_id, error = %e, "repair attempt failed validation");
            EngineError::Schema(e)
        })
    }

    async fn invoke(&self, query_id: &str, system: &str, user: &str) -> Result<String, EngineError> {
        let llm = self.llm.clone();
        let raw = with_retry(&self.policy, "llm_generate", query_id, |attempt| {
            let llm = llm.clone();
            async move {
                debug!(query_id, attempt, "calling model");
                llm.generate(system, user).await
            }
        })
        .await
        .map_err(EngineError::from_provider)?;
        Ok(raw)
    }
}
