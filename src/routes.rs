use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::proto;
use crate::state::AppState;
use crate::ws;

/// Build the axum Router: the WebSocket endpoint plus the two HTTP probes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_probe))
        .route("/health", get(health_probe))
        .route("/ws", get(ws::handler::ws_upgrade))
        .with_state(state)
}

/// GET / — liveness plus a rough size of the tracked fleet.
async fn status_probe(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "drivers": state.registry.driver_count(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /health — basic health check endpoint
async fn health_probe() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": proto::now_ms(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn status_probe_counts_drivers() {
        let state = AppState::new(Config::default());
        let Json(body) = status_probe(State(state.clone())).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["drivers"], 0);
    }

    #[tokio::test]
    async fn health_probe_reports_healthy() {
        let Json(body) = health_probe().await;
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].as_i64().is_some());
    }
}
