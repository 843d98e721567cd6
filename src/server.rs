//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/documents/{id}/ingest` | Chunk, embed, and index plain text |
//! | `DELETE` | `/documents/{id}` | Remove a document and its vectors |
//! | `POST` | `/compliance/search` | Evidence only, no model call |
//! | `POST` | `/compliance/analyze` | Full compliance verdict |
//! | `POST` | `/corrections` | Record a correction |
//! | `GET`  | `/corrections/{scope}` | List corrections of a scope |
//! | `POST` | `/corrections/{scope}/apply` | Fold pending corrections |
//! | `DELETE` | `/corrections/id/{id}` | Delete a correction |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `in_progress` (409),
//! `ingest_failed` (422), `unavailable` (503), `internal` (500).
//! Query-time failures always carry a generic message; provider output is
//! only logged.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use compliance_harness_core::models::{Correction, Document, DocumentClass, EvidenceItem};
use compliance_harness_core::store::ScopeFilter;

use crate::app::Harness;
use crate::config::Config;
use crate::corrections::{CorrectionError, NewCorrection};
use crate::engine::{AssessRequest, Assessment, EngineError};
use crate::ingest::IngestError;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    harness: Harness,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let harness = Harness::open(config).await?;
    let app = build_router(harness);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "compliance server listening");
    println!("Compliance server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full router over `harness`.
pub fn build_router(harness: Harness) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents/{id}/ingest", post(handle_ingest))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/compliance/search", post(handle_search))
        .route("/compliance/analyze", post(handle_analyze))
        .route("/corrections", post(handle_record_correction))
        .route("/corrections/{scope}", get(handle_list_corrections))
        .route("/corrections/{scope}/apply", post(handle_apply_corrections))
        .route("/corrections/id/{id}", delete(handle_delete_correction))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { harness })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        error!(error = %e, retryable = e.is_retryable(), "query failed");
        AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "unavailable",
            message: e.user_message().to_string(),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InProgress(id) => AppError {
                status: StatusCode::CONFLICT,
                code: "in_progress",
                message: format!("parse in progress for document {}", id),
            },
            other => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "ingest_failed",
                message: other.to_string(),
            },
        }
    }
}

/// Delete failures keep their own code; only the lease conflict is shared
/// with ingest.
fn delete_error(e: IngestError) -> AppError {
    match e {
        IngestError::InProgress(_) => AppError::from(e),
        other => {
            error!(error = %other, "document delete failed");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "delete_failed",
                message: "document could not be deleted".to_string(),
            }
        }
    }
}

impl From<CorrectionError> for AppError {
    fn from(e: CorrectionError) -> Self {
        match e {
            CorrectionError::EmptyField(field) => {
                bad_request(format!("{} must not be empty", field))
            }
            CorrectionError::Store(err) => {
                error!(error = %err, "correction store failed");
                internal("correction store unavailable")
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Documents ============

#[derive(Deserialize)]
struct IngestBody {
    text: String,
    class: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    knowledgebase_id: Option<String>,
}

#[derive(Serialize)]
struct IngestResponse {
    document_id: String,
    chunk_count: usize,
    status: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestResponse>, AppError> {
    let class: DocumentClass = body.class.parse().map_err(bad_request)?;
    let name = body.name.unwrap_or_else(|| id.clone());
    let document = Document::new(&id, name, class, body.knowledgebase_id);

    // The task keeps running if the client disconnects
    let handle = state.harness.ingestor.spawn(document, body.text)?;
    let outcome = handle
        .await
        .map_err(|e| internal(format!("ingest task failed: {}", e)))??;

    Ok(Json(IngestResponse {
        document_id: id,
        chunk_count: outcome.chunk_count,
        status: outcome.status.label().to_string(),
    }))
}

#[derive(Serialize)]
struct DeleteDocumentResponse {
    document_id: String,
    vectors_removed: usize,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteDocumentResponse>, AppError> {
    let vectors_removed = state
        .harness
        .ingestor
        .delete(&id)
        .await
        .map_err(delete_error)?;
    Ok(Json(DeleteDocumentResponse {
        document_id: id,
        vectors_removed,
    }))
}

// ============ Compliance ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter: ScopeFilter,
}

#[derive(Serialize)]
struct SearchResponse {
    evidence: Vec<EvidenceItem>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let query_id = Uuid::new_v4().to_string();
    let evidence = state
        .harness
        .retriever
        .retrieve(&query_id, &body.query, body.top_k, body.filter)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(SearchResponse { evidence }))
}

async fn handle_analyze(
    State(state): State<AppState>,
    Json(body): Json<AssessRequest>,
) -> Result<Json<Assessment>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    Ok(Json(state.harness.engine.assess(body).await?))
}

// ============ Corrections ============

async fn handle_record_correction(
    State(state): State<AppState>,
    Json(body): Json<NewCorrection>,
) -> Result<(StatusCode, Json<Correction>), AppError> {
    let correction = state.harness.corrections.record(body).await?;
    Ok((StatusCode::CREATED, Json(correction)))
}

#[derive(Serialize)]
struct CorrectionListResponse {
    scope: String,
    prompt_version: u64,
    corrections: Vec<Correction>,
}

async fn handle_list_corrections(
    State(state): State<AppState>,
    Path(scope): Path<String>,
) -> Result<Json<CorrectionListResponse>, AppError> {
    let corrections = state.harness.corrections.list(&scope).await?;
    let prompt = state.harness.corrections.active_prompt(&scope).await?;
    Ok(Json(CorrectionListResponse {
        scope,
        prompt_version: prompt.version,
        corrections,
    }))
}

#[derive(Serialize)]
struct ApplyResponse {
    applied: usize,
}

async fn handle_apply_corrections(
    State(state): State<AppState>,
    Path(scope): Path<String>,
) -> Result<Json<ApplyResponse>, AppError> {
    let applied = state.harness.corrections.apply(&scope).await?;
    Ok(Json(ApplyResponse { applied }))
}

async fn handle_delete_correction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.harness.corrections.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no correction with id: {}", id)))
    }
}
