use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::app::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Connection and peer counts plus the current peer list.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
