//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Terminal WebSocket connections
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,

    // PTY sessions
    pub active_sessions: AtomicU64,
    pub total_sessions_created: AtomicU64,
    /// Sessions whose shell exited on its own
    pub sessions_exited: AtomicU64,

    // Agent streams
    pub active_streams: AtomicU64,
    pub chat_requests: AtomicU64,
    pub prewarm_requests: AtomicU64,
    /// Frames written to SSE responses
    pub frames_sent: AtomicU64,

    // Terminal messages
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    /// PTY output chunks lost to a lagging subscriber
    pub messages_dropped: AtomicU64,
    pub malformed_messages: AtomicU64,

    // Errors
    pub pty_errors: AtomicU64,
    pub websocket_errors: AtomicU64,
    /// `error` and `session-conflict` frames sent to chat clients
    pub agent_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self, exited: bool) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        if exited {
            self.sessions_exited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stream_opened(&self, prewarm: bool) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        if prewarm {
            self.prewarm_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chat_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, is_error: bool) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.agent_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pty_error(&self) {
        self.pty_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total_created: self.total_sessions_created.load(Ordering::Relaxed),
                exited: self.sessions_exited.load(Ordering::Relaxed),
            },
            chat: ChatMetrics {
                active_streams: self.active_streams.load(Ordering::Relaxed),
                requests: self.chat_requests.load(Ordering::Relaxed),
                prewarms: self.prewarm_requests.load(Ordering::Relaxed),
                frames_sent: self.frames_sent.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                malformed: self.malformed_messages.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                pty: self.pty_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
                agent: self.agent_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub chat: ChatMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total_created: u64,
    pub exited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMetrics {
    pub active_streams: u64,
    pub requests: u64,
    pub prewarms: u64,
    pub frames_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub pty: u64,
    pub websocket: u64,
    pub agent: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub active: u64,
}
