use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let active_sessions = state.pty_manager.count().await as u64;
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.pty == 0 && metrics.errors.websocket == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions: metrics::SessionHealth {
            active: active_sessions,
        },
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(health_live_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let (state, _tmp) = crate::test_helpers::test_app_state();
        let json = get_json(test_router(state), "/health").await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"]["active"], 0);
        assert_eq!(json["connections"], 0);
        assert!(json["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_health_degraded_after_errors() {
        let (state, _tmp) = crate::test_helpers::test_app_state();
        state.metrics.pty_error();
        let json = get_json(test_router(state), "/health").await;
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn test_live_and_metrics() {
        let (state, _tmp) = crate::test_helpers::test_app_state();
        state.metrics.stream_opened(false);
        let app = test_router(state);

        let json = get_json(app.clone(), "/health/live").await;
        assert_eq!(json["status"], "alive");

        let json = get_json(app, "/metrics").await;
        assert_eq!(json["chat"]["requests"], 1);
        assert_eq!(json["sessions"]["total_created"], 0);
    }
}
