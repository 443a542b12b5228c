use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::classifier::{LineClass, LineClassifier};
use crate::error::{Result, StreamError};
use crate::frame::OutboundFrame;
use crate::session::{SessionContext, SessionIdentity, SessionStore, validate_session_id};
use crate::telemetry::{TelemetryExtractor, TelemetryLog};

/// Stderr text that means another process holds the session
pub const SESSION_IN_USE_MARKER: &str = "already in use";

/// Prompt used to start a session without a real user turn
pub const DEFAULT_PREWARM_PROBE: &str = "/status";

const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Frames for one request, ending with [`OutboundFrame::Done`]
pub type FrameStream = ReceiverStream<OutboundFrame>;

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Agent CLI to execute
    pub binary: String,
    /// The agent's state directory, holding `projects/<key>/<session>.jsonl`
    pub claude_dir: PathBuf,
    /// Appended after the session flags, before the prompt
    pub extra_args: Vec<String>,
    pub prewarm_probe: String,
    /// JSON-lines file for captured telemetry; `None` discards it
    pub telemetry_log: Option<PathBuf>,
    pub stderr_limit: usize,
    pub channel_capacity: usize,
}

impl MultiplexerConfig {
    pub fn new(binary: impl Into<String>, claude_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            claude_dir: claude_dir.into(),
            extra_args: Vec::new(),
            prewarm_probe: DEFAULT_PREWARM_PROBE.to_string(),
            telemetry_log: None,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// What the agent process is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// A user turn
    Chat { prompt: String },
    /// Create the session with the configured probe so the first real turn is fast
    Prewarm,
}

impl RunMode {
    fn label(&self) -> &'static str {
        match self {
            RunMode::Chat { .. } => "chat",
            RunMode::Prewarm => "prewarm",
        }
    }
}

/// Runs one agent process per request and multiplexes its stdout.
///
/// Structured records become [`OutboundFrame`]s on the returned stream,
/// telemetry blocks go to the telemetry log, and the process exit becomes
/// the terminal frames. Dropping the stream kills the process.
pub struct ProcessStreamMultiplexer {
    config: MultiplexerConfig,
    store: SessionStore,
    telemetry: Option<TelemetryLog>,
}

impl ProcessStreamMultiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        let store = SessionStore::new(&config.claude_dir);
        let telemetry = config.telemetry_log.clone().map(TelemetryLog::new);
        Self {
            config,
            store,
            telemetry,
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start the agent and stream its frames.
    ///
    /// Never fails: setup problems are reported as an `error` frame followed
    /// by `done`.
    pub fn run(&self, mode: RunMode, context: SessionContext) -> FrameStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(2));

        match self.spawn(&mode, &context) {
            Ok(child) => {
                let task = ProcessTask {
                    session_id: context.session_id,
                    stderr_limit: self.config.stderr_limit,
                    telemetry: self.telemetry.clone(),
                    tx,
                };
                tokio::spawn(task.run(child));
            }
            Err(e) => {
                warn!(
                    "Agent {} for session {} not started: {}",
                    mode.label(),
                    context.session_id,
                    e
                );
                tokio::spawn(async move {
                    let _ = tx.send(OutboundFrame::error(e.to_string())).await;
                    let _ = tx.send(OutboundFrame::Done).await;
                });
            }
        }

        ReceiverStream::new(rx)
    }

    fn spawn(&self, mode: &RunMode, context: &SessionContext) -> Result<Child> {
        validate_session_id(&context.session_id)?;

        let identity = self.store.identity(context);
        if *mode == RunMode::Prewarm && identity == SessionIdentity::Resume {
            return Err(StreamError::SessionExists(context.session_id.clone()));
        }

        let args = self.build_args(mode, context, identity);
        debug!(
            "Spawning {} {:?} in {}",
            self.config.binary,
            args,
            context.cwd.display()
        );

        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .current_dir(&context.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let env = context.provider_env();
        for name in &env.remove {
            command.env_remove(name);
        }
        for (name, value) in &env.set {
            command.env(name, value);
        }

        let child = command.spawn().map_err(|source| StreamError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;

        info!(
            "Agent {} started for session {} ({:?}, pid {:?})",
            mode.label(),
            context.session_id,
            identity,
            child.id()
        );
        Ok(child)
    }

    /// Command line for one run, without the binary
    pub fn build_args(
        &self,
        mode: &RunMode,
        context: &SessionContext,
        identity: SessionIdentity,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-mode",
            context.permission_mode.as_arg(),
        ]
        .into_iter()
        .map(String::from)
        .collect();

        match identity {
            // A resumed session keeps the model it was created with
            SessionIdentity::Resume => {
                args.push("--resume".to_string());
                args.push(context.session_id.clone());
            }
            SessionIdentity::Create => {
                args.push("--session-id".to_string());
                args.push(context.session_id.clone());
                if let Some(model) = context.model.as_ref().filter(|m| !m.is_empty()) {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
            }
        }

        args.extend(self.config.extra_args.iter().cloned());

        match mode {
            RunMode::Chat { prompt } => args.push(prompt.clone()),
            RunMode::Prewarm => args.push(self.config.prewarm_probe.clone()),
        }
        args
    }
}

/// Drives one spawned agent until it exits or the client goes away
struct ProcessTask {
    session_id: String,
    stderr_limit: usize,
    telemetry: Option<TelemetryLog>,
    tx: mpsc::Sender<OutboundFrame>,
}

impl ProcessTask {
    async fn run(self, mut child: Child) {
        let started = Instant::now();
        let stdout = child.stdout.take();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, self.stderr_limit)));

        let mut classifier = LineClassifier::new();
        let mut client_gone = false;

        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                tokio::select! {
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            let line = decode_line(&buf);
                            buf.clear();
                            if let LineClass::Frame(frame) = classifier.classify(&line) {
                                if self.tx.send(frame).await.is_err() {
                                    client_gone = true;
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Reading agent stdout for session {} failed: {}", self.session_id, e);
                            break;
                        }
                    },
                    _ = self.tx.closed() => {
                        client_gone = true;
                        break;
                    }
                }
            }
        }

        if client_gone {
            info!(
                "Client left session {}, stopping agent {:?}",
                self.session_id,
                child.id()
            );
            if let Err(e) = child.start_kill() {
                debug!("Agent for session {} already gone: {}", self.session_id, e);
            }
        }

        let exit_code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Waiting on agent for session {} failed: {}", self.session_id, e);
                None
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        self.persist_telemetry(&mut classifier).await;

        info!(
            "Agent for session {} exited with {:?} after {:?}",
            self.session_id,
            exit_code,
            started.elapsed()
        );

        if client_gone {
            return;
        }
        for frame in exit_frames(
            exit_code,
            classifier.success_seen(),
            &stderr,
            &self.session_id,
        ) {
            if self.tx.send(frame).await.is_err() {
                break;
            }
        }
    }

    async fn persist_telemetry(&self, classifier: &mut LineClassifier) {
        let blocks = classifier.take_telemetry_blocks();
        if blocks.is_empty() {
            return;
        }

        let records = TelemetryExtractor::parse_blocks(&blocks, Utc::now());
        debug!(
            "Session {} produced {} telemetry blocks ({} parsed)",
            self.session_id,
            blocks.len(),
            records.len()
        );

        if let Some(log) = &self.telemetry {
            if let Err(e) = log.append(&records).await {
                warn!("{}", e);
            }
        }
    }
}

/// One output line without its terminator. Bytes that are not UTF-8 are
/// replaced rather than ending the read.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn collect_stderr(stderr: ChildStderr, limit: usize) -> String {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut collected = String::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Reading agent stderr failed: {}", e);
                break;
            }
        }
        let line = decode_line(&buf);
        if line.is_empty() {
            continue;
        }
        debug!(stderr = %line, "Agent stderr");
        if collected.len() < limit {
            collected.push_str(&line);
            collected.push('\n');
        }
    }
    collected
}

/// Frames that close out a run.
///
/// A failed exit is forgiven once a success result was seen. `done` is
/// always last.
pub fn exit_frames(
    exit_code: Option<i32>,
    success_seen: bool,
    stderr: &str,
    session_id: &str,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::with_capacity(2);
    let failed = exit_code != Some(0);

    if failed && !success_seen {
        let stderr = stderr.trim();
        if stderr.contains(SESSION_IN_USE_MARKER) {
            frames.push(OutboundFrame::SessionConflict {
                session_id: session_id.to_string(),
                message: stderr.to_string(),
            });
        } else {
            let message = match exit_code {
                Some(code) => format!("agent exited with code {}", code),
                None => "agent was terminated by a signal".to_string(),
            };
            frames.push(OutboundFrame::Error {
                message,
                exit_code,
                stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
            });
        }
    }

    frames.push(OutboundFrame::Done);
    frames
}
