//! Term Transport - WebSocket client for remote PTY sessions
//!
//! Speaks the relay's JSON terminal protocol: `input` and `resize` up,
//! `connected`, `output`, `exit` and `error` down. A [`TerminalTransport`]
//! reconnects with exponential backoff when the socket drops unexpectedly,
//! and stays closed once the remote shell exits or the owner closes it.

mod backoff;
mod error;
pub mod protocol;
mod surface;
mod transport;

pub use backoff::ReconnectPolicy;
pub use error::{Result, TransportError};
pub use protocol::{ClientMessage, ServerMessage};
pub use surface::{TerminalSize, TerminalSurface, wait_for_surface};
pub use transport::{ConnectionState, TerminalTransport, TransportConfig, TransportEvent};
