use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("connection closed before the session was ready")]
    HandshakeClosed,

    #[error("timed out waiting for the session handshake")]
    HandshakeTimeout,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("transport is closed")]
    Closed,

    #[error("terminal surface still has no size after {attempts} attempts")]
    SurfaceNotReady { attempts: u32 },

    #[error("invalid message: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
