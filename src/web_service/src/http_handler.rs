use crate::http_server::GateRestState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

#[derive(Clone, Copy)]
pub struct MetricsHandler;

impl MetricsHandler {
    pub fn render(&self) -> String {
        if let Some(prometheus_handle) = common::metrics::try_handle() {
            prometheus_handle.render()
        } else {
            "Please initialize the prometheus context first.".to_string()
        }
    }
}

pub fn route_metrics<S>(metrics_handler: MetricsHandler) -> Router<S> {
    Router::new()
        .route("/metrics", get(metrics_get))
        .with_state(metrics_handler)
}

/// `200 {"status":"ok"}` while below the connection ceiling, otherwise
/// `503` with the reason.
pub async fn health_get(State(state): State<GateRestState>) -> impl IntoResponse {
    let active = state.stats.active_sessions();
    if active >= state.max_connections as u64 {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "reason": format!("active sessions {active} at configured max {}", state.max_connections),
            })),
        )
    } else {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    }
}

#[axum_macros::debug_handler]
async fn metrics_get(state: State<MetricsHandler>) -> String {
    state.render()
}
