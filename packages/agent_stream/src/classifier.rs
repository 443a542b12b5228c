use tracing::{debug, trace};

use crate::frame::{OutboundFrame, ParsedLine, parse_cli_line};
use crate::telemetry::has_telemetry_marker;

/// Where the classifier is between lines
#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    /// Saw a lone `{`; it belongs to telemetry only if the next line has a marker
    Speculative { opener: String },
    /// Inside a telemetry block until braces balance on a lone `}`
    Capturing { buffer: String, depth: i64 },
}

/// What one line of stdout turned out to be
#[derive(Debug, PartialEq)]
pub enum LineClass {
    Frame(OutboundFrame),
    Telemetry,
    Ignored,
}

/// Splits agent stdout into client frames and telemetry blocks.
///
/// Holds the per-process state: the capture state machine, completed
/// telemetry blocks, and whether a successful result or a model-bearing
/// message has been seen.
#[derive(Debug, Default)]
pub struct LineClassifier {
    state: State,
    blocks: Vec<String>,
    success_seen: bool,
    model_ready: bool,
}

impl LineClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, line: &str) -> LineClass {
        match std::mem::take(&mut self.state) {
            State::Capturing { buffer, depth } => self.continue_capture(buffer, depth, line),
            State::Speculative { opener } => {
                if has_telemetry_marker(line) {
                    let mut buffer = opener;
                    buffer.push('\n');
                    let depth = brace_delta(&buffer);
                    self.continue_capture(buffer, depth, line)
                } else {
                    trace!("Lone brace was not telemetry, dropping it");
                    self.classify_idle(line)
                }
            }
            State::Idle => self.classify_idle(line),
        }
    }

    fn classify_idle(&mut self, line: &str) -> LineClass {
        if has_telemetry_marker(line) {
            return self.continue_capture(String::new(), 0, line);
        }

        match parse_cli_line(line) {
            ParsedLine::Frame(frame) => {
                self.observe(&frame);
                LineClass::Frame(frame)
            }
            ParsedLine::Unforwarded(kind) => {
                debug!("Skipping {} record", kind);
                LineClass::Ignored
            }
            ParsedLine::NotARecord => {
                if line.trim() == "{" {
                    self.state = State::Speculative {
                        opener: line.to_string(),
                    };
                } else if !line.trim().is_empty() {
                    trace!("Ignoring non-record output: {}", line);
                }
                LineClass::Ignored
            }
        }
    }

    fn continue_capture(&mut self, mut buffer: String, depth: i64, line: &str) -> LineClass {
        buffer.push_str(line);
        buffer.push('\n');
        let depth = depth + brace_delta(line);

        if depth <= 0 && line.trim_end() == "}" {
            self.blocks.push(buffer);
        } else {
            self.state = State::Capturing { buffer, depth };
        }
        LineClass::Telemetry
    }

    fn observe(&mut self, frame: &OutboundFrame) {
        match frame {
            OutboundFrame::Result(result) if result.is_success() => self.success_seen = true,
            OutboundFrame::AssistantSnapshot { message } if message.model.is_some() => {
                self.model_ready = true
            }
            OutboundFrame::SystemInit(info) if info.model.is_some() => self.model_ready = true,
            _ => {}
        }
    }

    /// A success result arrived, so a nonzero exit is not reported as failure
    pub fn success_seen(&self) -> bool {
        self.success_seen
    }

    /// The CLI announced which model it is running
    pub fn model_ready(&self) -> bool {
        self.model_ready
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, State::Capturing { .. })
    }

    /// Drain completed blocks plus any block still open at end of output
    pub fn take_telemetry_blocks(&mut self) -> Vec<String> {
        if let State::Capturing { buffer, .. } = std::mem::take(&mut self.state) {
            self.blocks.push(buffer);
        }
        std::mem::take(&mut self.blocks)
    }
}

fn brace_delta(line: &str) -> i64 {
    line.chars().fold(0, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth - 1,
        _ => depth,
    })
}
