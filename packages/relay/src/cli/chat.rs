use agent_stream::{OutboundFrame, SessionContext, SseDecoder};
use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;
use transcript::{Notice, Role, Session, StreamReconstructor};

/// Conflicts retried with a fresh session id before giving up
const MAX_CONFLICT_RETRIES: usize = 1;

#[derive(Parser)]
pub struct ChatArgs {
    /// Server base URL, e.g. http://127.0.0.1:7890
    pub url: String,

    /// What to ask the agent
    pub prompt: String,

    /// Working directory for the agent (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Model for a new session
    #[arg(long)]
    pub model: Option<String>,

    /// Continue an existing session instead of starting a new one
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    prompt: &'a str,
    #[serde(flatten)]
    context: SessionContext,
}

enum TurnOutcome {
    Finished,
    /// The session id collided and has been reminted
    Retry,
}

/// Send one prompt and print the reply as it streams in
pub async fn chat_command(args: ChatArgs) -> Result<()> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut session = Session::new(cwd);
    session.model = args.model;
    if let Some(id) = args.session {
        session.id = id;
    }

    let client = reqwest::Client::new();
    let endpoint = format!("{}/api/chat", args.url.trim_end_matches('/'));
    let mut reconstructor = StreamReconstructor::new(session);
    reconstructor.begin_turn(&args.prompt);

    let mut retries = 0;
    loop {
        match run_turn(&client, &endpoint, &args.prompt, &mut reconstructor).await? {
            TurnOutcome::Finished => break,
            TurnOutcome::Retry if retries < MAX_CONFLICT_RETRIES => {
                retries += 1;
                reconstructor.reset_request();
            }
            TurnOutcome::Retry => anyhow::bail!("session id kept colliding, giving up"),
        }
    }

    println!();
    let usage = reconstructor.usage();
    eprintln!(
        "[session {} | {} in / {} out tokens | ${:.4}]",
        reconstructor.session().id,
        usage.input_tokens,
        usage.output_tokens,
        usage.cost_usd
    );
    match reconstructor.last_error() {
        Some(error) => anyhow::bail!("agent failed: {}", error),
        None => Ok(()),
    }
}

async fn run_turn(
    client: &reqwest::Client,
    endpoint: &str,
    prompt: &str,
    reconstructor: &mut StreamReconstructor,
) -> Result<TurnOutcome> {
    let body = ChatBody {
        prompt,
        context: reconstructor.session().context(),
    };
    let response = client
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?
        .error_for_status()
        .context("Chat request rejected")?;

    let mut printer = ReplyPrinter::default();
    let mut decoder = SseDecoder::new();
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.context("Chat stream interrupted")?;
        for frame in decoder.feed(&chunk) {
            if let Some(outcome) = apply_frame(reconstructor, &mut printer, frame) {
                return Ok(outcome);
            }
        }
    }
    if let Some(frame) = decoder.finish() {
        if let Some(outcome) = apply_frame(reconstructor, &mut printer, frame) {
            return Ok(outcome);
        }
    }
    // Stream ended without `done`
    Ok(TurnOutcome::Finished)
}

fn apply_frame(
    reconstructor: &mut StreamReconstructor,
    printer: &mut ReplyPrinter,
    frame: OutboundFrame,
) -> Option<TurnOutcome> {
    debug!("Frame {}", frame.kind());
    let notice = reconstructor.apply(frame);
    printer.update(reconstructor);

    match notice? {
        Notice::Error(message) => {
            eprintln!("\n[error: {}]", message);
            None
        }
        Notice::SessionConflict {
            previous, new_id, ..
        } => {
            eprintln!("\n[session {} is busy, retrying as {}]", previous, new_id);
            Some(TurnOutcome::Retry)
        }
        Notice::Finished => Some(TurnOutcome::Finished),
    }
}

/// Prints the streaming reply incrementally
#[derive(Default)]
struct ReplyPrinter {
    message_id: Option<String>,
    shown: String,
    tools_shown: usize,
}

impl ReplyPrinter {
    fn update(&mut self, reconstructor: &StreamReconstructor) {
        let mut stdout = std::io::stdout().lock();

        for tool in &reconstructor.tools()[self.tools_shown.min(reconstructor.tools().len())..] {
            let _ = writeln!(stdout, "\n[tool: {}]", tool.name);
        }
        self.tools_shown = reconstructor.tools().len();

        let Some(message) = reconstructor.current_message() else {
            return;
        };
        if message.role != Role::Assistant {
            return;
        }
        if self.message_id.as_deref() != Some(message.id.as_str()) {
            self.message_id = Some(message.id.clone());
            self.shown.clear();
        }

        let text = message.text();
        // A snapshot may rewrite text already shown; only append what extends it
        if let Some(rest) = text.strip_prefix(self.shown.as_str()) {
            let _ = stdout.write_all(rest.as_bytes());
            let _ = stdout.flush();
        }
        self.shown = text;
    }
}
