//! Frame types exchanged between the relay and its clients.
//!
//! The agent CLI prints one JSON record per line. Records we recognize are
//! re-tagged as [`OutboundFrame`]s; the relay adds the terminal `error`,
//! `session-conflict` and `done` frames itself.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single content block inside an assistant or user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, rename = "content")]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        #[serde(default)]
        source: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Tool calls and tool results; everything else is conversational
    pub fn is_tool(&self) -> bool {
        matches!(
            self,
            ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
        )
    }
}

/// Token accounting reported by the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "zero_if_null")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub output_tokens: u64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub cache_creation_input_tokens: u64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub cache_read_input_tokens: u64,
}

fn zero_if_null<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or_default())
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// A complete message as the CLI last saw it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "content_list")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// User messages sometimes carry a bare string instead of a block list
fn content_list<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match Content::deserialize(deserializer)? {
        Content::Text(text) => vec![ContentBlock::Text { text }],
        Content::Blocks(blocks) => blocks,
    })
}

/// Incremental update inside a content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Raw model streaming event, forwarded verbatim as `stream-delta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// Session metadata announced once at process start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitInfo {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerStatus>,
}

/// Final accounting for a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ResultInfo {
    pub fn is_success(&self) -> bool {
        !self.is_error && (self.subtype.is_empty() || self.subtype == "success")
    }

    /// Human-readable reason for a failed result
    pub fn error_message(&self) -> String {
        if !self.errors.is_empty() {
            return self.errors.join("; ");
        }
        match &self.result {
            Some(text) if !text.trim().is_empty() => text.clone(),
            _ if !self.subtype.is_empty() => self.subtype.clone(),
            _ => "agent reported an error".to_string(),
        }
    }
}

/// Typed event sent to a client over one request/response cycle.
///
/// Every stream ends with exactly one [`OutboundFrame::Done`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    SystemInit(InitInfo),
    AssistantSnapshot {
        message: MessageSnapshot,
    },
    UserSnapshot {
        message: MessageSnapshot,
    },
    StreamDelta {
        event: StreamEvent,
    },
    Result(ResultInfo),
    SessionConflict {
        session_id: String,
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    Done,
}

impl OutboundFrame {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::SystemInit(_) => "system-init",
            OutboundFrame::AssistantSnapshot { .. } => "assistant-snapshot",
            OutboundFrame::UserSnapshot { .. } => "user-snapshot",
            OutboundFrame::StreamDelta { .. } => "stream-delta",
            OutboundFrame::Result(_) => "result",
            OutboundFrame::SessionConflict { .. } => "session-conflict",
            OutboundFrame::Error { .. } => "error",
            OutboundFrame::Done => "done",
        }
    }
}

/// A line of CLI stdout, as printed by `--output-format stream-json`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliRecord {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(flatten)]
        init: InitInfo,
    },
    Assistant {
        message: MessageSnapshot,
    },
    User {
        message: MessageSnapshot,
    },
    StreamEvent {
        event: StreamEvent,
    },
    Result(ResultInfo),
}

/// Outcome of parsing one stdout line as a structured record
#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    /// A record the client should see
    Frame(OutboundFrame),
    /// A recognized record with no client-facing counterpart
    Unforwarded(&'static str),
    /// Not a structured record
    NotARecord,
}

/// Parse a CLI stdout line into a frame.
pub fn parse_cli_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return ParsedLine::NotARecord;
    }

    let record = match serde_json::from_str::<CliRecord>(trimmed) {
        Ok(record) => record,
        Err(_) => return ParsedLine::NotARecord,
    };

    match record {
        CliRecord::System { subtype, init } if subtype == "init" => {
            ParsedLine::Frame(OutboundFrame::SystemInit(init))
        }
        CliRecord::System { .. } => ParsedLine::Unforwarded("system"),
        CliRecord::Assistant { message } => {
            ParsedLine::Frame(OutboundFrame::AssistantSnapshot { message })
        }
        CliRecord::User { message } => ParsedLine::Frame(OutboundFrame::UserSnapshot { message }),
        CliRecord::StreamEvent { event } => ParsedLine::Frame(OutboundFrame::StreamDelta { event }),
        CliRecord::Result(result) => ParsedLine::Frame(OutboundFrame::Result(result)),
    }
}
