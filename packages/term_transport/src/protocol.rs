//! JSON messages exchanged over the terminal WebSocket.

use serde::{Deserialize, Serialize};

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First message on every connection; carries the PTY session id
    Connected { id: String },
    Output { data: String },
    /// The shell exited; the server closes the socket afterwards
    Exit { code: Option<i32> },
    Error { message: String },
}
