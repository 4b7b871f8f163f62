//! HTTP surface of the query service.
//!
//! `/health` is open; everything under `/api/v1` requires the configured key
//! in the `X-API-Key` header.

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::query::{
    DataPoint, DataQuery, LocationInfo, QueryError, QueryService, RawDataQuery, Summary,
    SummaryQuery,
};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiState {
    pub query: Arc<QueryService>,
    pub api_key: Arc<str>,
}

impl ApiState {
    pub fn new(query: QueryService, api_key: &str) -> Self {
        Self {
            query: Arc::new(query),
            api_key: Arc::from(api_key),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::LocationNotFound => StatusCode::NOT_FOUND,
            QueryError::UnexpectedSummary { .. } | QueryError::Store(_) => {
                log::error!("[API] {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, self.to_string())
    }
}

/// Compare a presented key against the expected one in constant time.
pub fn validate_key(presented: &str, expected: &str) -> bool {
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    match presented {
        Some(key) if validate_key(key, &state.api_key) => next.run(request).await,
        _ => error_response(StatusCode::UNAUTHORIZED, "missing or invalid API key"),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn summary(
    State(state): State<ApiState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Summary>, QueryError> {
    Ok(Json(state.query.summary(&query).await?))
}

async fn data(
    State(state): State<ApiState>,
    Query(raw): Query<RawDataQuery>,
) -> Result<Json<Vec<DataPoint>>, QueryError> {
    let query = DataQuery::parse(&raw)?;
    Ok(Json(state.query.data(&query).await?))
}

async fn locations(State(state): State<ApiState>) -> Result<Json<Vec<LocationInfo>>, QueryError> {
    Ok(Json(state.query.locations().await?))
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/locations", get(locations))
        .route("/sensors/summary", get(summary))
        .route("/sensors/data", get(data))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Serve the API on `listener` until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<()>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("[API] listening on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await?;

    log::info!("[API] stopped");
    Ok(())
}
