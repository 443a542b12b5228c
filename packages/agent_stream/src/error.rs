use std::path::PathBuf;

/// Errors raised while preparing or running an agent process
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("session {0} already exists; prewarm only applies to new sessions")]
    SessionExists(String),

    #[error("failed to start agent `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write telemetry log {path:?}: {source}")]
    TelemetryLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
