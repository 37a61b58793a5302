//! Read API over the knowledge graph.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/tools/search` | Similarity search over entities |
//! | `POST` | `/tools/file_context` | A file and its graph neighbourhood |
//! | `POST` | `/tools/decision_history` | Decisions behind a file or feature |
//! | `POST` | `/tools/entity_history` | One entity and its revisions |
//!
//! Every tool body accepts an optional `project`; when omitted the first
//! configured tenant's project is used.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::store::{
    EntityHistory, EntityKind, EntityRecord, FileContext, KnowledgeStore, NaturalKey, SearchHit,
    StoreError,
};

const DEFAULT_TOP_K: usize = 10;
const DEFAULT_CONTEXT_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn KnowledgeStore>,
    default_project: Arc<str>,
}

impl AppState {
    fn project(&self, requested: Option<String>) -> String {
        requested
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_project.to_string())
    }
}

/// Build the router. Exposed so callers can mount it or serve it on their
/// own listener.
pub fn router(store: Arc<dyn KnowledgeStore>, default_project: &str) -> Router {
    let state = AppState {
        store,
        default_project: Arc::from(default_project),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/search", post(handle_search))
        .route("/tools/file_context", post(handle_file_context))
        .route("/tools/decision_history", post(handle_decision_history))
        .route("/tools/entity_history", post(handle_entity_history))
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until `shutdown` fires.
pub async fn serve(
    config: &Config,
    store: Arc<dyn KnowledgeStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let default_project = config
        .tenants
        .first()
        .map(|t| t.project.as_str())
        .unwrap_or("default");
    let app = router(store, default_project);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("read API listening on http://{}", config.server.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
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

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidInput(msg) => bad_request(msg),
            other => {
                tracing::error!(error = %other, "store query failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: other.to_string(),
                }
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

// ============ POST /tools/search ============

#[derive(Deserialize)]
struct SearchRequest {
    #[serde(default)]
    project: Option<String>,
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let project = state.project(req.project);
    let top_k = req.top_k.unwrap_or(DEFAULT_TOP_K).clamp(1, 100);
    let results = state
        .store
        .search_by_query(&project, &req.query, top_k)
        .await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /tools/file_context ============

#[derive(Deserialize)]
struct FileContextRequest {
    #[serde(default)]
    project: Option<String>,
    path: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_file_context(
    State(state): State<AppState>,
    Json(req): Json<FileContextRequest>,
) -> Result<Json<FileContext>, AppError> {
    if req.path.trim().is_empty() {
        return Err(bad_request("path must not be empty"));
    }
    let project = state.project(req.project);
    let limit = req.limit.unwrap_or(DEFAULT_CONTEXT_LIMIT);
    state
        .store
        .get_context_for_file(&project, &req.path, limit)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no file matching '{}' in {}", req.path, project)))
}

// ============ POST /tools/decision_history ============

#[derive(Deserialize)]
struct DecisionHistoryRequest {
    #[serde(default)]
    project: Option<String>,
    target: String,
}

#[derive(Serialize)]
struct DecisionHistoryResponse {
    decisions: Vec<EntityRecord>,
}

async fn handle_decision_history(
    State(state): State<AppState>,
    Json(req): Json<DecisionHistoryRequest>,
) -> Result<Json<DecisionHistoryResponse>, AppError> {
    if req.target.trim().is_empty() {
        return Err(bad_request("target must not be empty"));
    }
    let project = state.project(req.project);
    let decisions = state
        .store
        .get_decision_history(&project, &req.target)
        .await?;
    Ok(Json(DecisionHistoryResponse { decisions }))
}

// ============ POST /tools/entity_history ============

#[derive(Deserialize)]
struct EntityHistoryRequest {
    #[serde(default)]
    project: Option<String>,
    platform: String,
    kind: String,
    platform_id: String,
}

async fn handle_entity_history(
    State(state): State<AppState>,
    Json(req): Json<EntityHistoryRequest>,
) -> Result<Json<EntityHistory>, AppError> {
    let kind: EntityKind = req.kind.parse()?;
    let project = state.project(req.project);
    let key = NaturalKey::new(req.platform, req.platform_id, kind);
    state
        .store
        .get_entity_history(&project, &key)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no entity {} in {}", key, project)))
}
