//! Server-sent events framing for [`OutboundFrame`]s.
//!
//! Each frame is one `data:` event carrying its JSON. The terminal
//! [`OutboundFrame::Done`] travels as the `[DONE]` sentinel.

use tracing::warn;

use crate::error::Result;
use crate::frame::OutboundFrame;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Payload of the `data:` field for a frame
pub fn frame_data(frame: &OutboundFrame) -> Result<String> {
    match frame {
        OutboundFrame::Done => Ok(DONE_SENTINEL.to_string()),
        frame => Ok(serde_json::to_string(frame)?),
    }
}

/// A complete event, including the blank line that ends it
pub fn encode_event(frame: &OutboundFrame) -> Result<String> {
    Ok(format!("data: {}\n\n", frame_data(frame)?))
}

pub fn decode_data(data: &str) -> Result<OutboundFrame> {
    if data.trim() == DONE_SENTINEL {
        return Ok(OutboundFrame::Done);
    }
    Ok(serde_json::from_str(data)?)
}

/// Incremental decoder for an SSE byte stream.
///
/// Chunks may split events (or UTF-8 sequences) anywhere. Events whose data
/// is not a valid frame are logged and skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<OutboundFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments, `event:`, `id:` and `retry:` carry nothing for us
        }
        frames
    }

    /// Flush an event left unterminated at end of stream
    pub fn finish(&mut self) -> Option<OutboundFrame> {
        if !self.pending.is_empty() {
            self.feed(b"\n");
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<OutboundFrame> {
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();

        match decode_data(&data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Skipping undecodable event: {}", e);
                None
            }
        }
    }
}
