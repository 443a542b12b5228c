use agent_stream::{
    ContentBlock, PermissionMode, Provider, ProviderConfig, SessionContext, Usage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

pub(crate) fn mint_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Client-side conversation identity.
///
/// The id is never persisted; it is minted fresh for each conversation and
/// again whenever the server reports a conflict.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub provider: Provider,
    pub provider_config: ProviderConfig,
    pub permission_mode: PermissionMode,
}

impl Session {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: mint_id(),
            cwd: cwd.into(),
            model: None,
            provider: Provider::default(),
            provider_config: ProviderConfig::default(),
            permission_mode: PermissionMode::default(),
        }
    }

    /// Replace the id, returning the old one
    pub fn remint(&mut self) -> String {
        std::mem::replace(&mut self.id, mint_id())
    }

    /// What the server needs to run a request for this session
    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            cwd: self.cwd.clone(),
            model: self.model.clone(),
            provider: self.provider,
            provider_config: self.provider_config.clone(),
            permission_mode: self.permission_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptMessage {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Still receiving frames for this message
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
}

impl TranscriptMessage {
    pub(crate) fn new(role: Role, content: Vec<ContentBlock>, streaming: bool) -> Self {
        Self {
            id: mint_id(),
            role,
            content,
            model: None,
            streaming,
            created_at: Utc::now(),
        }
    }

    /// All text blocks, concatenated
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Success,
    Error,
}

/// One tool call, keyed by its tool-use id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
}

/// Usage summed over every successful result in the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cost_usd: f64,
    pub results: u32,
}

impl UsageTotals {
    pub(crate) fn add(&mut self, usage: Option<&Usage>, cost_usd: Option<f64>) {
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
            self.cache_creation_input_tokens += usage.cache_creation_input_tokens;
            self.cache_read_input_tokens += usage.cache_read_input_tokens;
        }
        self.cost_usd += cost_usd.unwrap_or(0.0);
        self.results += 1;
    }
}

/// Something the application should surface after a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// User-visible failure
    Error(String),
    /// The id collided; retry the request under `new_id`
    SessionConflict {
        previous: String,
        new_id: String,
        message: String,
    },
    /// The stream ended
    Finished,
}
