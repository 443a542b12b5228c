//! Transcript - client-side view of an agent conversation
//!
//! Feed the frames of each request into a [`StreamReconstructor`] in order.
//! It keeps an ordered list of messages, a record of every tool call, usage
//! totals and the session identity, and reports anything the user should see
//! as a [`Notice`].

mod reconstructor;
mod types;

pub use reconstructor::{StreamReconstructor, merge_snapshot};
pub use types::{
    Notice, Role, Session, ToolExecution, ToolStatus, TranscriptMessage, UsageTotals,
};
