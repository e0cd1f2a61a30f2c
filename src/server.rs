//! HTTP API server.
//!
//! Exposes the enrichment pipeline as a JSON API:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Endpoint directory |
//! | `GET`  | `/api/health` | Component health check |
//! | `GET`  | `/api/schema` | Live database schema mapping |
//! | `POST` | `/api/semantic-search` | Top-K schema items for a query |
//! | `POST` | `/api/query` | Full natural-language query pipeline |
//!
//! # Error Contract
//!
//! Every error response is a flat body with a 4xx/5xx status:
//!
//! ```json
//! { "error": "No query provided" }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends
//! can call the API directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::embedding::EmbeddingError;
use crate::models::{DatabaseSchema, SearchResult, StructuredQueryResult};
use crate::pipeline::{PipelineError, QueryEnrichmentPipeline};
use crate::schema;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<QueryEnrichmentPipeline>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(
    config: Arc<Config>,
    pipeline: Arc<QueryEnrichmentPipeline>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState { config, pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handle_root))
        .route("/api/health", get(handle_health))
        .route("/api/schema", get(handle_schema))
        .route("/api/semantic-search", post(handle_semantic_search))
        .route("/api/query", post(handle_query))
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state);

    info!("listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error body: `{"error": "<message>"}`.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Upstream(_)
            | PipelineError::Embedding(EmbeddingError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

// ============ Request / response records ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Serialize)]
struct RootResponse {
    message: String,
    endpoints: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    components: HealthComponents,
}

#[derive(Serialize)]
struct HealthComponents {
    database: &'static str,
    agent: &'static str,
}

#[derive(Serialize)]
struct SemanticSearchResponse {
    results: Vec<SearchResult>,
}

/// Unwrap a JSON extraction and require a non-empty `query` field.
fn require_query(
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<String, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.to_string()))?;
    if request.query.trim().is_empty() {
        return Err(bad_request("No query provided"));
    }
    Ok(request.query)
}

// ============ Handlers ============

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Welcome to SmartSQL API".to_string(),
        endpoints: BTreeMap::from([
            ("/api/health", "Health check endpoint"),
            ("/api/schema", "Get database schema"),
            ("/api/query", "Process natural language queries"),
            ("/api/semantic-search", "Search schema semantically"),
        ]),
    })
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match sqlx::query("SELECT 1").fetch_one(state.pipeline.pool()).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    // The agent client is constructed up front; reachability is only known
    // at invoke time, so health reports whether it is configured at all.
    let agent = if std::env::var(&state.config.agent.api_key_env).is_ok() {
        "healthy"
    } else {
        "unhealthy"
    };

    let status = if database == "healthy" && agent == "healthy" {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        components: HealthComponents { database, agent },
    })
}

async fn handle_schema(
    State(state): State<AppState>,
) -> Result<Json<DatabaseSchema>, AppError> {
    let live_schema = schema::get_schema(state.pipeline.pool())
        .await
        .map_err(|e| upstream_error(e.to_string()))?;
    Ok(Json(live_schema))
}

async fn handle_semantic_search(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<SemanticSearchResponse>, AppError> {
    let query = require_query(payload)?;
    let results = state.pipeline.semantic_search(&query, None).await?;
    Ok(Json(SemanticSearchResponse { results }))
}

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<StructuredQueryResult>, AppError> {
    let query = require_query(payload)?;
    let result = state.pipeline.process(&query).await?;
    Ok(Json(result))
}

async fn handle_not_found() -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: "Resource not found".to_string(),
    }
}
