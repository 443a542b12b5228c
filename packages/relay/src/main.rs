use agent_stream::ProcessStreamMultiplexer;
use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use pty_manager::PtyManager;
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod handlers;
mod metrics;
#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, RelayDirs};
use crate::metrics::ServerMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Agent chat relay and remote terminal server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground (the default)
    Server(ServerArgs),

    /// Open a remote shell on a running server
    Attach(cli::attach::AttachArgs),

    /// Send one prompt to a running server and print the reply
    Chat(cli::chat::ChatArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Agent executable (overrides config)
    #[arg(long)]
    agent: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live PTY sessions, one per terminal connection
    pub pty_manager: Arc<PtyManager>,
    pub multiplexer: Arc<ProcessStreamMultiplexer>,
    pub config: Arc<FileConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = RelayDirs::new(cli.data_dir)?;
    let config = dirs.load()?;

    match cli.command {
        None => run_server(ServerArgs::default(), dirs, config).await,
        Some(Commands::Server(args)) => run_server(args, dirs, config).await,
        Some(Commands::Attach(args)) => cli::attach::attach_command(args).await,
        Some(Commands::Chat(args)) => cli::chat::chat_command(args).await,
        Some(Commands::Config) => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

pub(crate) fn app_router(state: AppState) -> Router {
    Router::new()
        // Agent streams
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/chat/prewarm", post(handlers::prewarm_handler))
        // Remote terminals
        .route("/api/terminal/ws", get(handlers::terminal_ws_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServerArgs, dirs: RelayDirs, mut config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "relay=debug,agent_stream=debug,pty_manager=debug,tower_http=debug,info"
    } else {
        "relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting relay");

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(agent) = args.agent {
        config.agent.binary = agent;
    }

    let multiplexer_config = config.agent.multiplexer_config(&dirs)?;
    info!(
        "Agent: {} (state in {}, telemetry to {:?})",
        multiplexer_config.binary,
        multiplexer_config.claude_dir.display(),
        multiplexer_config.telemetry_log
    );

    let pty_manager = Arc::new(PtyManager::new());
    let state = AppState {
        pty_manager: pty_manager.clone(),
        multiplexer: Arc::new(ProcessStreamMultiplexer::new(multiplexer_config)),
        config: Arc::new(config.clone()),
        metrics: Arc::new(ServerMetrics::new()),
    };

    let app = app_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}", config.server.host))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/chat            - Stream one agent turn (SSE)");
    info!("  POST   /api/chat/prewarm    - Create a session ahead of time (SSE)");
    info!("  GET    /api/terminal/ws     - WebSocket shell session");
    info!("  GET    /health              - Server status");

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Stopping terminal sessions...");
    let killed = pty_manager.kill_all().await;
    info!("Stopped {} sessions", killed);

    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, cleaning up...");
}
