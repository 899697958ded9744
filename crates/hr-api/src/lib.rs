//! HookRelay HTTP API
//!
//! - `POST /webhooks/:source`: verify and acknowledge a webhook
//! - `GET /health`: liveness and registered sources
//! - `GET /metrics`: Prometheus exposition, when a recorder is installed

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use hr_common::Headers;
use hr_dispatch::{DispatchOutcome, Dispatcher};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Option<PrometheusHandle>,
}

/// Body of every non-2xx answer
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
        let body = ApiError {
            error: error.to_string(),
            message: message.into(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sources: Vec<&'static str>,
    pub in_flight: usize,
}

/// Create the full router with all endpoints
pub fn create_router(dispatcher: Arc<Dispatcher>, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState { dispatcher, metrics };

    Router::new()
        .route("/webhooks/:source", post(receive_webhook))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Map a dispatch outcome to the HTTP answer for the source
pub fn outcome_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Accepted { request_id } => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                status: "processing",
                request_id,
            }),
        )
            .into_response(),
        DispatchOutcome::Unauthorized => {
            ApiError::response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Signature verification failed")
        }
        DispatchOutcome::Malformed { reason } => {
            ApiError::response(StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD", reason)
        }
        DispatchOutcome::UnknownSource(source) => ApiError::response(
            StatusCode::NOT_FOUND,
            "UNKNOWN_SOURCE",
            format!("No integration registered for '{}'", source),
        ),
    }
}

/// Header values that are not visible ASCII are dropped
fn to_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    debug!(source = %source, bytes = body.len(), "Webhook request");
    let outcome = state.dispatcher.dispatch(&source, body, to_headers(&headers));
    outcome_response(outcome)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        version: env!("CARGO_PKG_VERSION"),
        sources: state.dispatcher.sources().iter().map(|s| s.as_str()).collect(),
        in_flight: state.dispatcher.in_flight(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::response(StatusCode::NOT_FOUND, "NOT_FOUND", "Metrics exporter not installed"),
    }
}
