//! Session identity, provider credentials and the on-disk session store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};

/// Model provider the agent authenticates against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    Bedrock,
    Vertex,
    Foundry,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Anthropic,
        Provider::Bedrock,
        Provider::Vertex,
        Provider::Foundry,
    ];

    /// Every environment variable this provider reads
    pub fn env_vars(self) -> &'static [&'static str] {
        match self {
            Provider::Anthropic => &["ANTHROPIC_API_KEY"],
            Provider::Bedrock => &[
                "CLAUDE_CODE_USE_BEDROCK",
                "AWS_REGION",
                "AWS_BEARER_TOKEN_BEDROCK",
            ],
            Provider::Vertex => &[
                "CLAUDE_CODE_USE_VERTEX",
                "CLOUD_ML_REGION",
                "ANTHROPIC_VERTEX_PROJECT_ID",
            ],
            Provider::Foundry => &[
                "CLAUDE_CODE_USE_FOUNDRY",
                "ANTHROPIC_FOUNDRY_RESOURCE",
                "ANTHROPIC_FOUNDRY_API_KEY",
            ],
        }
    }
}

/// Credentials and placement for the selected provider
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("project_id", &self.project_id)
            .field("resource_name", &self.resource_name)
            .finish()
    }
}

/// Variables to set and variables to clear for one agent process.
///
/// `remove` holds every other provider's variables, so the two lists never
/// share a name.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProviderEnv {
    pub set: Vec<(&'static str, String)>,
    pub remove: Vec<&'static str>,
}

impl ProviderEnv {
    pub fn for_provider(provider: Provider, config: &ProviderConfig) -> Self {
        let mut set = Vec::new();
        let mut push = |name: &'static str, value: &Option<String>| {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                set.push((name, value.clone()));
            }
        };

        match provider {
            Provider::Anthropic => push("ANTHROPIC_API_KEY", &config.api_key),
            Provider::Bedrock => {
                push("CLAUDE_CODE_USE_BEDROCK", &Some("1".to_string()));
                push("AWS_REGION", &config.region);
                push("AWS_BEARER_TOKEN_BEDROCK", &config.api_key);
            }
            Provider::Vertex => {
                push("CLAUDE_CODE_USE_VERTEX", &Some("1".to_string()));
                push("CLOUD_ML_REGION", &config.region);
                push("ANTHROPIC_VERTEX_PROJECT_ID", &config.project_id);
            }
            Provider::Foundry => {
                push("CLAUDE_CODE_USE_FOUNDRY", &Some("1".to_string()));
                push("ANTHROPIC_FOUNDRY_RESOURCE", &config.resource_name);
                push("ANTHROPIC_FOUNDRY_API_KEY", &config.api_key);
            }
        }

        let remove = Provider::ALL
            .into_iter()
            .filter(|other| *other != provider)
            .flat_map(|other| other.env_vars().iter().copied())
            .collect();

        Self { set, remove }
    }
}

/// Tool permission policy passed to the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_arg(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

/// Everything that identifies one agent conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub provider_config: ProviderConfig,
    #[serde(default)]
    pub permission_mode: PermissionMode,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            model: None,
            provider: Provider::default(),
            provider_config: ProviderConfig::default(),
            permission_mode: PermissionMode::default(),
        }
    }

    pub fn provider_env(&self) -> ProviderEnv {
        ProviderEnv::for_provider(self.provider, &self.provider_config)
    }
}

/// Session ids become file names, so only a conservative alphabet is accepted
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StreamError::InvalidSessionId(id.to_string()))
    }
}

/// How the agent is told which conversation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdentity {
    /// Continue the transcript already on disk
    Resume,
    /// Start a new transcript under a caller-chosen id
    Create,
}

/// The agent's per-project transcript directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// `root` is the agent's state directory (usually `~/.claude`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.root.join("projects").join(project_key(cwd))
    }

    pub fn session_file(&self, cwd: &Path, session_id: &str) -> PathBuf {
        self.project_dir(cwd).join(format!("{}.jsonl", session_id))
    }

    pub fn identity(&self, context: &SessionContext) -> SessionIdentity {
        if self
            .session_file(&context.cwd, &context.session_id)
            .is_file()
        {
            SessionIdentity::Resume
        } else {
            SessionIdentity::Create
        }
    }
}

/// Directory name the agent uses for a working directory
pub fn project_key(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn provider_env_sets_and_removes_are_disjoint() {
        let config = ProviderConfig {
            api_key: Some("key".into()),
            region: Some("us-east-1".into()),
            project_id: Some("proj".into()),
            resource_name: Some("res".into()),
        };

        for provider in Provider::ALL {
            let env = ProviderEnv::for_provider(provider, &config);
            let set: HashSet<&str> = env.set.iter().map(|(k, _)| *k).collect();
            let remove: HashSet<&str> = env.remove.iter().copied().collect();
            assert!(set.is_disjoint(&remove), "{:?} overlaps", provider);

            let all: HashSet<&str> = Provider::ALL
                .iter()
                .flat_map(|p| p.env_vars().iter().copied())
                .collect();
            let covered: HashSet<&str> = set.union(&remove).copied().collect();
            assert_eq!(covered, all, "{:?} leaves variables untouched", provider);
        }
    }

    #[test]
    fn bedrock_env() {
        let env = ProviderEnv::for_provider(
            Provider::Bedrock,
            &ProviderConfig {
                api_key: Some("tok".into()),
                region: Some("eu-west-1".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            env.set,
            vec![
                ("CLAUDE_CODE_USE_BEDROCK", "1".to_string()),
                ("AWS_REGION", "eu-west-1".to_string()),
                ("AWS_BEARER_TOKEN_BEDROCK", "tok".to_string()),
            ]
        );
        assert!(env.remove.contains(&"ANTHROPIC_API_KEY"));
    }

    #[test]
    fn missing_values_are_not_set() {
        let env = ProviderEnv::for_provider(Provider::Anthropic, &ProviderConfig::default());
        assert!(env.set.is_empty());
        assert!(!env.remove.contains(&"ANTHROPIC_API_KEY"));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = ProviderConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(validate_session_id("0b6c1d2e-aaaa-4bbb-8ccc-123456789abc").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("a/b").is_err());
    }

    #[test]
    fn session_file_layout() {
        let store = SessionStore::new("/home/me/.claude");
        assert_eq!(project_key(Path::new("/home/me/my.project")), "-home-me-my-project");
        assert_eq!(
            store.session_file(Path::new("/work"), "abc"),
            PathBuf::from("/home/me/.claude/projects/-work/abc.jsonl")
        );
    }

    #[test]
    fn identity_follows_session_file() {
        let root = tempfile::tempdir().unwrap();
        let store = SessionStore::new(root.path());
        let context = SessionContext::new("abc", "/work");
        assert_eq!(store.identity(&context), SessionIdentity::Create);

        let file = store.session_file(&context.cwd, &context.session_id);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "{}\n").unwrap();
        assert_eq!(store.identity(&context), SessionIdentity::Resume);
    }

    #[test]
    fn context_deserializes_with_defaults() {
        let context: SessionContext = serde_json::from_str(
            r#"{"session_id":"abc","cwd":"/work","provider":"vertex","permission_mode":"acceptEdits"}"#,
        )
        .unwrap();
        assert_eq!(context.provider, Provider::Vertex);
        assert_eq!(context.permission_mode, PermissionMode::AcceptEdits);
        assert!(context.model.is_none());
    }
}
