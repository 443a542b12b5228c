use agent_stream::{DEFAULT_PREWARM_PROBE, MultiplexerConfig};
use anyhow::{Context, Result};
use pty_manager::PtyOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [agent]
//                    binary = "/opt/claude/bin/claude"
//
//   env var:         RELAY_AGENT__BINARY=/opt/claude/bin/claude
//
//   (double underscore = nesting, single underscore stays within field names)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub agent: AgentFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
}

/// Listener settings (`[server]`)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Browser origins allowed to open terminals besides the server's own
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Agent process settings (`[agent]`)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentFileConfig {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Agent state directory; `~/.claude` when unset
    #[serde(default)]
    pub claude_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_prewarm_probe")]
    pub prewarm_probe: String,
    /// Telemetry JSONL file; `<data_dir>/logs/telemetry.jsonl` when unset
    #[serde(default)]
    pub telemetry_log: Option<PathBuf>,
    #[serde(default = "default_stderr_limit_kb")]
    pub stderr_limit_kb: usize,
}

impl Default for AgentFileConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            claude_dir: None,
            extra_args: Vec::new(),
            prewarm_probe: default_prewarm_probe(),
            telemetry_log: None,
            stderr_limit_kb: default_stderr_limit_kb(),
        }
    }
}

/// Defaults for spawned shells (`[terminal]`)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7890
}
fn default_agent_binary() -> String {
    "claude".to_string()
}
fn default_prewarm_probe() -> String {
    DEFAULT_PREWARM_PROBE.to_string()
}
fn default_stderr_limit_kb() -> usize {
    64
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

/// Build a figment that layers: defaults → config.toml → RELAY_* env vars.
///
///   `RELAY_SERVER__PORT=8080`  →  `server.port = 8080`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

impl AgentFileConfig {
    pub fn multiplexer_config(&self, dirs: &RelayDirs) -> Result<MultiplexerConfig> {
        let claude_dir = match &self.claude_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .context("Could not find home directory for the agent state")?
                .join(".claude"),
        };

        let mut config = MultiplexerConfig::new(self.binary.clone(), claude_dir);
        config.extra_args = self.extra_args.clone();
        config.prewarm_probe = self.prewarm_probe.clone();
        config.telemetry_log = Some(
            self.telemetry_log
                .clone()
                .unwrap_or_else(|| dirs.telemetry_log_path()),
        );
        config.stderr_limit = self.stderr_limit_kb * 1024;
        Ok(config)
    }
}

/// Per-connection overrides from the terminal WebSocket query string.
///
/// The shell itself only comes from `[terminal]`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TerminalOverrides {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<PathBuf>,
}

impl TerminalFileConfig {
    pub fn pty_options(&self, overrides: &TerminalOverrides) -> PtyOptions {
        // A zero dimension means the client could not measure itself
        let cols = overrides.cols.filter(|c| *c > 0).unwrap_or(self.cols);
        let rows = overrides.rows.filter(|r| *r > 0).unwrap_or(self.rows);

        PtyOptions {
            shell: self.shell.clone(),
            cwd: overrides.cwd.clone().or_else(|| self.cwd.clone()),
            cols,
            rows,
            ..Default::default()
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayDirs {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RelayDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, logs_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn telemetry_log_path(&self) -> PathBuf {
        self.logs_dir.join("telemetry.jsonl")
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
