//! Agent Stream - one agent CLI process per request, as typed frames
//!
//! The agent prints newline-delimited JSON records interleaved with
//! multi-line telemetry dumps on the same stdout. [`ProcessStreamMultiplexer`]
//! spawns the process, runs every line through a [`LineClassifier`], forwards
//! structured records as [`OutboundFrame`]s, persists telemetry, and closes
//! each stream with exactly one `done` frame.
//!
//! # Example
//!
//! ```no_run
//! use agent_stream::{
//!     MultiplexerConfig, OutboundFrame, ProcessStreamMultiplexer, RunMode, SessionContext,
//! };
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let multiplexer =
//!         ProcessStreamMultiplexer::new(MultiplexerConfig::new("claude", "/home/me/.claude"));
//!     let context = SessionContext::new("0b6c1d2e-aaaa-4bbb-8ccc-123456789abc", "/home/me/src");
//!
//!     let mut frames = multiplexer.run(RunMode::Chat { prompt: "hi".into() }, context);
//!     while let Some(frame) = frames.next().await {
//!         if frame == OutboundFrame::Done {
//!             break;
//!         }
//!         println!("{}", frame.kind());
//!     }
//! }
//! ```

mod classifier;
mod error;
pub mod frame;
mod multiplexer;
pub mod session;
pub mod sse;
pub mod telemetry;

pub use classifier::{LineClass, LineClassifier};
pub use error::{Result, StreamError};
pub use frame::{
    BlockDelta, ContentBlock, InitInfo, MessageSnapshot, OutboundFrame, ResultInfo, StreamEvent,
    Usage,
};
pub use multiplexer::{
    DEFAULT_PREWARM_PROBE, FrameStream, MultiplexerConfig, ProcessStreamMultiplexer, RunMode,
    SESSION_IN_USE_MARKER, exit_frames,
};
pub use session::{
    PermissionMode, Provider, ProviderConfig, SessionContext, SessionIdentity, SessionStore,
};
pub use sse::SseDecoder;
pub use telemetry::{TelemetryExtractor, TelemetryLog, TelemetryRecord, relaxed_to_json};
