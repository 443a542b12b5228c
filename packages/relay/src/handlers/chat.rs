use agent_stream::{FrameStream, OutboundFrame, RunMode, SessionContext};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::AppState;
use crate::metrics::ServerMetrics;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub context: SessionContext,
}

#[derive(Debug, Deserialize)]
pub struct PrewarmRequest {
    #[serde(flatten)]
    pub context: SessionContext,
}

/// Run one agent turn and stream its frames as server-sent events
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "prompt must not be empty" })),
        )
            .into_response();
    }

    info!(
        "Chat turn for session {} in {}",
        request.context.session_id,
        request.context.cwd.display()
    );
    state.metrics.stream_opened(false);
    let frames = state.multiplexer.run(
        RunMode::Chat {
            prompt: request.prompt,
        },
        request.context,
    );
    frame_events(frames, state.metrics.clone()).into_response()
}

/// Create the session ahead of the first turn
pub async fn prewarm_handler(
    State(state): State<AppState>,
    Json(request): Json<PrewarmRequest>,
) -> Response {
    info!("Prewarming session {}", request.context.session_id);
    state.metrics.stream_opened(true);
    let frames = state.multiplexer.run(RunMode::Prewarm, request.context);
    frame_events(frames, state.metrics.clone()).into_response()
}

/// Decrements the active stream count when the response body is dropped
struct ActiveStream(Arc<ServerMetrics>);

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.stream_closed();
    }
}

fn frame_events(
    frames: FrameStream,
    metrics: Arc<ServerMetrics>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let active = ActiveStream(metrics);
    let events = frames.filter_map(move |frame| {
        let metrics = &active.0;
        let is_error = matches!(
            frame,
            OutboundFrame::Error { .. } | OutboundFrame::SessionConflict { .. }
        );
        match agent_stream::sse::frame_data(&frame) {
            Ok(data) => {
                metrics.frame_sent(is_error);
                Some(Ok(Event::default().data(data)))
            }
            Err(e) => {
                warn!("Dropping unencodable {} frame: {}", frame.kind(), e);
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::post};
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/chat", post(chat_handler))
            .route("/chat/prewarm", post(prewarm_handler))
            .with_state(state)
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> (StatusCode, String) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn data_lines(body: &str) -> Vec<&str> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect()
    }

    #[tokio::test]
    async fn test_chat_streams_error_then_done_when_agent_missing() {
        let (state, tmp) = crate::test_helpers::test_app_state();
        let metrics = state.metrics.clone();
        let (status, body) = post_json(
            test_router(state),
            "/chat",
            serde_json::json!({
                "prompt": "hello",
                "session_id": "3f1c2a9e-0000-4000-8000-000000000001",
                "cwd": tmp.path(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = data_lines(&body);
        assert_eq!(data.len(), 2, "body: {}", body);
        let error: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(data[1], "[DONE]");

        assert_eq!(metrics.chat_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.frames_sent.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.agent_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_streams.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_chat_rejects_unsafe_session_id_in_stream() {
        let (state, tmp) = crate::test_helpers::test_app_state();
        let (status, body) = post_json(
            test_router(state),
            "/chat",
            serde_json::json!({
                "prompt": "hello",
                "session_id": "../../etc/passwd",
                "cwd": tmp.path(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = data_lines(&body);
        let error: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        assert!(
            error["message"]
                .as_str()
                .unwrap()
                .contains("session id"),
            "message: {}",
            error["message"]
        );
        assert_eq!(data.last(), Some(&"[DONE]"));
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_prompt() {
        let (state, tmp) = crate::test_helpers::test_app_state();
        let (status, body) = post_json(
            test_router(state),
            "/chat",
            serde_json::json!({
                "prompt": "   ",
                "session_id": "abc",
                "cwd": tmp.path(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("prompt"));
    }

    #[tokio::test]
    async fn test_prewarm_of_existing_session_is_refused() {
        let (state, tmp) = crate::test_helpers::test_app_state();
        let cwd = tmp.path().join("project");
        std::fs::create_dir_all(&cwd).unwrap();

        let session_id = "3f1c2a9e-0000-4000-8000-000000000002";
        let context = SessionContext::new(session_id, &cwd);
        let session_file = state.multiplexer.store().session_file(&context.cwd, session_id);
        std::fs::create_dir_all(session_file.parent().unwrap()).unwrap();
        std::fs::write(&session_file, "{}\n").unwrap();

        let metrics = state.metrics.clone();
        let (status, body) = post_json(
            test_router(state),
            "/chat/prewarm",
            serde_json::json!({ "session_id": session_id, "cwd": cwd }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = data_lines(&body);
        assert_eq!(data.len(), 2, "body: {}", body);
        let error: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(data[1], "[DONE]");
        assert_eq!(metrics.prewarm_requests.load(Ordering::Relaxed), 1);
    }
}
