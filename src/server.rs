//! HTTP read API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health state; 200 while queries can be served, else 503 |
//! | `GET`  | `/api/v1/status` | Full status payload |
//! | `POST` | `/api/v1/query` | Similarity search |
//! | `GET`  | `/api/v1/documents/{id}` | One document |
//! | `GET`  | `/api/v1/stats` | Precomputed statistics |
//! | `GET`  | `/api/v1/ids` | Flattened id cache |
//! | `GET`  | `/api/v1/ids/{id}/suggestions` | Fuzzy id suggestions |
//! | `GET`  | `/api/v1/threats/{id}` | Defenses for a threat id |
//! | `POST` | `/api/v1/sync` | Start a sync (202) unless one is running (409) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "temporarily_unavailable", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `sync_in_progress`
//! (409), `rate_limited` (429, with `Retry-After`), `embedding_error` (500),
//! `not_ready` and `temporarily_unavailable` (503, with `Retry-After`).
//!
//! Every route is rate limited per minute (`POST /api/v1/sync` more
//! strictly), every request produces an `audit` event, and every response
//! carries the headers from [`middleware::security_headers`].

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use defense_kb_core::lookup::{is_well_formed_id, IdSuggestion};
use defense_kb_core::models::{IdCacheEntry, SearchHit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::QueryEngine;
use crate::error::EngineError;
use crate::middleware::{self, RateLimiter};
use crate::status::{self, HealthState, StatusReport};
use crate::sync::{SyncOrchestrator, TriggerResult};

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<QueryEngine>,
    orchestrator: Arc<SyncOrchestrator>,
    sync_interval: Duration,
    retry_after_secs: u64,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        engine: Arc<QueryEngine>,
        orchestrator: Arc<SyncOrchestrator>,
        sync_interval: Duration,
        retry_after_secs: u64,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            engine,
            orchestrator,
            sync_interval,
            retry_after_secs,
            limiter,
        }
    }

    fn fail(&self, err: EngineError) -> AppError {
        AppError::from_engine(err, self.retry_after_secs)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/documents/{id}", get(handle_document))
        .route("/api/v1/stats", get(handle_stats))
        .route("/api/v1/ids", get(handle_ids))
        .route("/api/v1/ids/{id}/suggestions", get(handle_suggestions))
        .route("/api/v1/threats/{id}", get(handle_threat))
        .route(middleware::SYNC_ROUTE, post(handle_sync))
        .route_layer(from_fn_with_state(Arc::clone(&state.limiter), middleware::rate_limit))
        .route_layer(from_fn(middleware::audit))
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    for layer in middleware::security_headers() {
        app = app.layer(layer);
    }
    app.with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn run_server(bind: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
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

pub(crate) struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl AppError {
    pub(crate) fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after: Some(retry_after_secs),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests; slow down",
            )
        }
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    fn from_engine(err: EngineError, default_retry_after: u64) -> Self {
        let message = err.to_string();
        match err {
            EngineError::NotReady(_) => Self {
                retry_after: Some(default_retry_after),
                ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", message)
            },
            EngineError::TemporarilyUnavailable { retry_after_secs } => Self {
                retry_after: Some(retry_after_secs),
                ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable", message)
            },
            EngineError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            EngineError::InvalidQuery(_) => Self::new(StatusCode::BAD_REQUEST, "bad_request", message),
            EngineError::Embedding(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "embedding_error", message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ============ Status ============

#[derive(Serialize)]
struct HealthResponse {
    status: HealthState,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let report = status::report(&state.engine, &state.orchestrator, state.sync_interval).await;
    let code = if report.state.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: report.state,
            version: report.version,
        }),
    )
        .into_response()
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(status::report(&state.engine, &state.orchestrator, state.sync_interval).await)
}

// ============ Query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<SearchHit>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let results = state
        .engine
        .search(&req.query, req.top_k)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(QueryResponse { results }))
}

async fn handle_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let doc = state.engine.get_by_id(&id).await.map_err(|e| state.fail(e))?;
    Ok(Json(doc).into_response())
}

async fn handle_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let stats = state.orchestrator.get_stats().await.map_err(|e| state.fail(e))?;
    Ok(Json(stats).into_response())
}

#[derive(Serialize)]
struct IdsResponse {
    count: usize,
    ids: Vec<IdCacheEntry>,
}

async fn handle_ids(State(state): State<AppState>) -> Result<Json<IdsResponse>, AppError> {
    let ids = state.engine.get_id_cache().await.map_err(|e| state.fail(e))?;
    Ok(Json(IdsResponse {
        count: ids.len(),
        ids,
    }))
}

#[derive(Deserialize)]
struct SuggestParams {
    #[serde(default = "default_suggestions")]
    k: usize,
}

fn default_suggestions() -> usize {
    5
}

#[derive(Serialize)]
struct SuggestResponse {
    query: String,
    well_formed: bool,
    exists: bool,
    suggestions: Vec<IdSuggestion>,
}

async fn handle_suggestions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<SuggestResponse>, AppError> {
    let query = id.trim().to_uppercase();
    let exists = match state.engine.get_by_id(&query).await {
        Ok(_) => true,
        Err(EngineError::NotFound(_)) => false,
        Err(e) => return Err(state.fail(e)),
    };
    let suggestions = if exists {
        Vec::new()
    } else {
        state
            .engine
            .suggest_ids(&query, params.k)
            .await
            .map_err(|e| state.fail(e))?
    };

    Ok(Json(SuggestResponse {
        well_formed: is_well_formed_id(&query),
        query,
        exists,
        suggestions,
    }))
}

async fn handle_threat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let defenses = state
        .engine
        .defenses_for_threat(&id)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(defenses).into_response())
}

// ============ Sync ============

#[derive(Serialize)]
struct SyncResponse {
    status: TriggerResult,
}

async fn handle_sync(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.orchestrator.trigger_sync() {
        TriggerResult::Accepted => Ok((
            StatusCode::ACCEPTED,
            Json(SyncResponse {
                status: TriggerResult::Accepted,
            }),
        )
            .into_response()),
        TriggerResult::AlreadyInProgress => Err(AppError::new(
            StatusCode::CONFLICT,
            "sync_in_progress",
            "a sync is already in progress",
        )),
    }
}
