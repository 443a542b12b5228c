use agent_stream::{
    BlockDelta, ContentBlock, InitInfo, MessageSnapshot, OutboundFrame, ResultInfo, StreamEvent,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::{
    Notice, Role, Session, ToolExecution, ToolStatus, TranscriptMessage, UsageTotals, mint_id,
};

/// Rebuilds the transcript and tool executions from an ordered frame stream.
///
/// Frames must be applied one at a time in arrival order: partial tool input
/// and the open text block carry over from one frame to the next.
#[derive(Debug)]
pub struct StreamReconstructor {
    session: Session,
    init: Option<InitInfo>,
    messages: Vec<TranscriptMessage>,
    tools: Vec<ToolExecution>,
    tool_positions: HashMap<String, usize>,
    usage: UsageTotals,
    last_error: Option<String>,

    // Per request
    current: Option<usize>,
    open_text: Option<usize>,
    partial_json: HashMap<u32, String>,
    index_tools: HashMap<u32, String>,
    success_seen: bool,
}

impl StreamReconstructor {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            init: None,
            messages: Vec::new(),
            tools: Vec::new(),
            tool_positions: HashMap::new(),
            usage: UsageTotals::default(),
            last_error: None,
            current: None,
            open_text: None,
            partial_json: HashMap::new(),
            index_tools: HashMap::new(),
            success_seen: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn init(&self) -> Option<&InitInfo> {
        self.init.as_ref()
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    /// The assistant message this request is filling in
    pub fn current_message(&self) -> Option<&TranscriptMessage> {
        self.current.map(|i| &self.messages[i])
    }

    /// Tool executions in first-seen order
    pub fn tools(&self) -> &[ToolExecution] {
        &self.tools
    }

    pub fn tool(&self, id: &str) -> Option<&ToolExecution> {
        self.tool_positions.get(id).map(|&i| &self.tools[i])
    }

    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn success_seen(&self) -> bool {
        self.success_seen
    }

    /// Record the user's prompt and start a new request
    pub fn begin_turn(&mut self, prompt: &str) {
        self.messages.push(TranscriptMessage::new(
            Role::User,
            vec![ContentBlock::text(prompt)],
            false,
        ));
        self.reset_request();
    }

    /// Forget per-request state, e.g. before retrying under a new session id
    pub fn reset_request(&mut self) {
        if let Some(i) = self.current.take() {
            self.messages[i].streaming = false;
        }
        self.open_text = None;
        self.partial_json.clear();
        self.index_tools.clear();
        self.success_seen = false;
        self.last_error = None;
    }

    /// Drop the whole transcript and start over under a fresh id
    pub fn new_conversation(&mut self) {
        self.reset_request();
        self.messages.clear();
        self.tools.clear();
        self.tool_positions.clear();
        self.usage = UsageTotals::default();
        self.init = None;
        self.session.remint();
    }

    pub fn apply(&mut self, frame: OutboundFrame) -> Option<Notice> {
        match frame {
            OutboundFrame::SystemInit(info) => {
                debug!(
                    "Session {:?} ready with model {:?}",
                    info.session_id, info.model
                );
                self.init = Some(info);
                None
            }
            OutboundFrame::AssistantSnapshot { message } => {
                self.apply_assistant_snapshot(message);
                None
            }
            OutboundFrame::UserSnapshot { message } => {
                self.apply_user_snapshot(&message);
                None
            }
            OutboundFrame::StreamDelta { event } => {
                self.apply_event(event);
                None
            }
            OutboundFrame::Result(result) => self.apply_result(result),
            OutboundFrame::Error { message, .. } => self.surface_error(message),
            OutboundFrame::SessionConflict { message, .. } => {
                let previous = self.session.remint();
                info!(
                    "Session id {} is in use, continuing as {}",
                    previous, self.session.id
                );
                Some(Notice::SessionConflict {
                    previous,
                    new_id: self.session.id.clone(),
                    message,
                })
            }
            OutboundFrame::Done => {
                if let Some(i) = self.current.take() {
                    self.messages[i].streaming = false;
                }
                self.open_text = None;
                Some(Notice::Finished)
            }
        }
    }

    fn apply_assistant_snapshot(&mut self, message: MessageSnapshot) {
        for block in &message.content {
            if let ContentBlock::ToolUse { id, name, input } = block {
                self.register_tool(id, name, input);
            }
        }

        let current = self.current_index();
        let live = &mut self.messages[current];
        live.content = merge_snapshot(&live.content, &message.content);
        if message.model.is_some() {
            live.model = message.model;
        }
        // The snapshot is authoritative for whatever text was open
        self.open_text = None;
    }

    fn apply_user_snapshot(&mut self, message: &MessageSnapshot) {
        for block in &message.content {
            if let ContentBlock::ToolResult {
                tool_use_id,
                output,
                is_error,
            } = block
            {
                match self.tool_positions.get(tool_use_id) {
                    Some(&i) => {
                        let tool = &mut self.tools[i];
                        tool.output = Some(output.clone());
                        tool.status = if *is_error {
                            ToolStatus::Error
                        } else {
                            ToolStatus::Success
                        };
                    }
                    None => debug!("Result for unknown tool {}", tool_use_id),
                }
            }
        }
    }

    fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, input },
            } => {
                self.open_text = None;
                let id = if !id.is_empty() {
                    id
                } else {
                    self.index_tools
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(mint_id)
                };

                self.register_tool(&id, &name, &input);
                self.index_tools.insert(index, id.clone());
                self.partial_json.remove(&index);

                let current = self.current_index();
                let content = &mut self.messages[current].content;
                let known = content
                    .iter()
                    .any(|block| matches!(block, ContentBlock::ToolUse { id: existing, .. } if *existing == id));
                if !known {
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
            StreamEvent::ContentBlockStart {
                content_block: ContentBlock::Text { text },
                ..
            } => {
                self.open_text = None;
                if !text.is_empty() {
                    self.append_text(&text);
                }
            }
            StreamEvent::ContentBlockStart { .. } => self.open_text = None,
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } => self.append_text(&text),
            StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta { partial_json },
            } => self.append_tool_input(index, &partial_json),
            _ => {}
        }
    }

    fn apply_result(&mut self, result: ResultInfo) -> Option<Notice> {
        if result.is_success() {
            self.success_seen = true;
            self.usage.add(result.usage.as_ref(), result.total_cost_usd);
            None
        } else {
            self.surface_error(result.error_message())
        }
    }

    /// Errors after a successful result are stale and stay invisible
    fn surface_error(&mut self, message: String) -> Option<Notice> {
        if self.success_seen {
            debug!("Ignoring error after success: {}", message);
            return None;
        }
        self.last_error = Some(message.clone());
        Some(Notice::Error(message))
    }

    fn current_index(&mut self) -> usize {
        match self.current {
            Some(i) => i,
            None => {
                self.messages
                    .push(TranscriptMessage::new(Role::Assistant, Vec::new(), true));
                let i = self.messages.len() - 1;
                self.current = Some(i);
                i
            }
        }
    }

    fn append_text(&mut self, text: &str) {
        let current = self.current_index();
        let content = &mut self.messages[current].content;

        let open = match self.open_text {
            Some(i) if matches!(content.get(i), Some(ContentBlock::Text { .. })) => i,
            _ => {
                content.push(ContentBlock::text(""));
                content.len() - 1
            }
        };
        if let Some(ContentBlock::Text { text: existing }) = content.get_mut(open) {
            existing.push_str(text);
        }
        self.open_text = Some(open);
    }

    fn append_tool_input(&mut self, index: u32, fragment: &str) {
        let buffer = self.partial_json.entry(index).or_default();
        buffer.push_str(fragment);

        // Incomplete JSON is expected mid-stream; keep accumulating
        let Ok(input) = serde_json::from_str::<Value>(buffer) else {
            return;
        };
        let Some(id) = self.index_tools.get(&index).cloned() else {
            return;
        };

        if let Some(&i) = self.tool_positions.get(&id) {
            self.tools[i].input = input.clone();
        }
        if let Some(current) = self.current {
            for block in &mut self.messages[current].content {
                if let ContentBlock::ToolUse {
                    id: block_id,
                    input: block_input,
                    ..
                } = block
                {
                    if *block_id == id {
                        *block_input = input.clone();
                    }
                }
            }
        }
    }

    fn register_tool(&mut self, id: &str, name: &str, input: &Value) {
        match self.tool_positions.get(id) {
            Some(&i) => {
                let tool = &mut self.tools[i];
                if is_empty_input(&tool.input) && !is_empty_input(input) {
                    tool.input = input.clone();
                }
                if tool.name.is_empty() {
                    tool.name = name.to_string();
                }
            }
            None => {
                self.tool_positions.insert(id.to_string(), self.tools.len());
                self.tools.push(ToolExecution {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                    output: None,
                    status: ToolStatus::Pending,
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

fn is_empty_input(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Merge a full snapshot into live content.
///
/// Tool-use blocks are unioned by id in first-seen order, with existing
/// entries keeping their data and only empty fields filled. The snapshot's
/// other blocks then replace the live ones; a snapshot without any keeps
/// the live ones.
pub fn merge_snapshot(live: &[ContentBlock], snapshot: &[ContentBlock]) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for block in live.iter().chain(snapshot) {
        let ContentBlock::ToolUse { id, name, input } = block else {
            continue;
        };
        match positions.get(id) {
            Some(&i) => {
                if let ContentBlock::ToolUse {
                    name: existing_name,
                    input: existing_input,
                    ..
                } = &mut merged[i]
                {
                    if existing_name.is_empty() {
                        *existing_name = name.clone();
                    }
                    if is_empty_input(existing_input) && !is_empty_input(input) {
                        *existing_input = input.clone();
                    }
                }
            }
            None => {
                positions.insert(id.clone(), merged.len());
                merged.push(block.clone());
            }
        }
    }

    let conversational = |blocks: &[ContentBlock]| -> Vec<ContentBlock> {
        blocks
            .iter()
            .filter(|block| {
                !matches!(
                    block,
                    ContentBlock::ToolUse { .. } | ContentBlock::Unknown
                )
            })
            .cloned()
            .collect()
    };

    let rest = conversational(snapshot);
    if rest.is_empty() {
        merged.extend(conversational(live));
    } else {
        merged.extend(rest);
    }
    merged
}
