//! HTTP transport over the query workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version and the active database backend |
//! | `POST` | `/query` | Run the workflow and return the full answer |
//! | `POST` | `/query/stream` | Run the workflow, streaming the answer as SSE |
//!
//! Both query endpoints take `{"query": "..."}` and an optional `x-user-id`
//! header. Requests without a user id are answered without conversation
//! memory and are not persisted.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Invalid query. ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `upstream_error` (500), `internal` (500).
//! Messages are fixed per code and never carry backend detail.
//!
//! # Streaming
//!
//! `POST /query/stream` answers `text/event-stream` with one
//! `data: <json>\n\n` frame per [`WorkflowEvent`]. A request that fails
//! before generation starts gets a single `error` frame.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::ConnectionManager;
use crate::error::WorkflowError;
use crate::migrate;
use crate::models::WorkflowEvent;
use crate::setup::build_workflow;
use crate::workflow::Workflow;

/// Header carrying the caller's numeric user id.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    workflow: Workflow,
    db: Arc<ConnectionManager>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Initializes the schema first; a database outage at startup is logged
/// and the server still comes up, answering without memory or persistence
/// until a backend returns.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let db = Arc::new(ConnectionManager::from_config(&config.db));
    if let Err(e) = migrate::ensure_schema(&db).await {
        warn!(error = %format!("{:#}", e), "schema initialization failed, starting anyway");
    }

    let workflow = build_workflow(config, Arc::clone(&db))?;
    let app = router(workflow, db);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "knowledge assistant listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(workflow: Workflow, db: Arc<ConnectionManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/query/stream", post(handle_query_stream))
        .layer(cors)
        .with_state(AppState { workflow, db })
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
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        let status = match err {
            WorkflowError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.user_message().to_string(),
        }
    }
}

fn user_id(headers: &HeaderMap) -> Result<Option<i32>, AppError> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .map(Some)
        .ok_or_else(|| bad_request(format!("{} must be an integer", USER_ID_HEADER)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// `"ok"`, or `"degraded"` when no database backend is reachable.
    status: String,
    version: String,
    /// `"primary"`, `"standby"` or `"unavailable"`.
    database: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.db.get_connection().await {
        Ok(conn) => conn.backend().to_string(),
        Err(e) => {
            warn!(error = %e, "health check found no database");
            "unavailable".to_string()
        }
    };
    let status = if database == "unavailable" { "degraded" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Serialize)]
struct QueryResponse {
    query: String,
    response: String,
    processed_query: String,
    context_used: bool,
    memory_used: bool,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let user_id = user_id(&headers)?;
    let outcome = state.workflow.run(&req.query, user_id).await?;

    Ok(Json(QueryResponse {
        query: outcome.query,
        response: outcome.answer,
        processed_query: outcome.normalized_query,
        context_used: outcome.context_used,
        memory_used: outcome.memory_used,
    }))
}

// ============ POST /query/stream ============

async fn handle_query_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let user_id = user_id(&headers)?;
    match state.workflow.run_stream(&req.query, user_id).await {
        Ok(events) => Ok(sse_response(events)),
        Err(e) => {
            warn!(code = e.code(), "streaming query rejected before generation");
            Ok(sse_response(tokio_stream::once(WorkflowEvent::error(
                e.user_message(),
            ))))
        }
    }
}

fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = WorkflowEvent> + Send + 'static,
{
    let frames = events.map(|event| event.to_sse_frame());
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
