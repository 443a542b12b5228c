use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use term_transport::{
    ConnectionState, ReconnectPolicy, TerminalSize, TerminalTransport, TransportConfig,
    TransportEvent, wait_for_surface,
};
use tokio::sync::mpsc;

use crate::cli::terminal::{RawMode, StdoutSurface, stdout_size};

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]
const SURFACE_ATTEMPTS: u32 = 10;
const SURFACE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
pub struct AttachArgs {
    /// Terminal endpoint, e.g. ws://127.0.0.1:7890/api/terminal/ws
    pub url: String,

    /// First reconnect delay in milliseconds (doubles per attempt)
    #[arg(long, default_value = "1000")]
    pub reconnect_ms: u64,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "5")]
    pub max_attempts: u32,
}

/// What happened when an attach session ended.
enum AttachOutcome {
    /// User pressed Ctrl-] to detach
    Detached,
    /// The remote shell exited
    Exited(Option<i32>),
    /// The connection was lost and could not be re-established
    Lost(u32),
}

/// Bridge the local terminal to a remote shell until it exits or the user
/// detaches.
pub async fn attach_command(args: AttachArgs) -> Result<()> {
    let size = match wait_for_surface(&StdoutSurface, SURFACE_ATTEMPTS, SURFACE_INTERVAL).await {
        Ok(size) => size,
        Err(e) => {
            eprintln!("[relay: {}; using 80x24]", e);
            TerminalSize::default()
        }
    };

    let mut config = TransportConfig::new(args.url);
    config.reconnect = ReconnectPolicy {
        initial_interval: Duration::from_millis(args.reconnect_ms),
        max_attempts: args.max_attempts,
    };

    let (mut transport, mut events) = TerminalTransport::new(config.clone());
    let session_id = transport
        .connect(size)
        .await
        .with_context(|| format!("Failed to connect to {}", config.url))?;
    eprintln!("[relay: attached to {} -- Ctrl-] to detach]", session_id);

    let raw_mode = RawMode::enable();

    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    // Blocking stdin reader thread (with poll so it can shut down cleanly)
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let stdin_shutdown = Arc::new(AtomicBool::new(false));
    let stdin_shutdown_thread = stdin_shutdown.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        use std::os::fd::AsRawFd;
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if stdin_shutdown_thread.load(Ordering::Relaxed) {
                break;
            }
            // Poll stdin with 100ms timeout so we can check the shutdown flag
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut handle = stdin.lock();
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    drop(handle);
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let outcome = loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                let (input, detach) = match data.iter().position(|&b| b == DETACH_BYTE) {
                    Some(pos) => (&data[..pos], true),
                    None => (&data[..], false),
                };
                if !input.is_empty() {
                    // A send error means the transport is reconnecting or closed;
                    // the event stream reports which.
                    let _ = transport
                        .send_input(String::from_utf8_lossy(input).into_owned())
                        .await;
                }
                if detach {
                    break AttachOutcome::Detached;
                }
            }

            event = events.recv() => match event {
                Some(TransportEvent::Output(data)) => {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(data.as_bytes());
                    let _ = stdout.flush();
                }
                Some(TransportEvent::Exit(code)) => break AttachOutcome::Exited(code),
                Some(TransportEvent::ServerError(message)) => {
                    eprint!("\r\n[relay: {}]\r\n", message);
                }
                Some(TransportEvent::StateChanged(ConnectionState::Reconnecting { attempt })) => {
                    eprint!("\r\n[relay: connection lost, reconnect attempt {}]\r\n", attempt);
                }
                Some(TransportEvent::Reconnected { session_id }) => {
                    eprint!("\r\n[relay: reconnected to new session {}]\r\n", session_id);
                }
                Some(TransportEvent::Failed { attempts }) => break AttachOutcome::Lost(attempts),
                Some(TransportEvent::StateChanged(_)) => {}
                None => break AttachOutcome::Exited(None),
            },

            _ = sigwinch.recv() => {
                if let Ok(size) = stdout_size() {
                    if !size.is_empty() {
                        let _ = transport.resize(size.cols, size.rows).await;
                    }
                }
            }
        }
    };

    // Shut down the stdin reader and restore the terminal before printing
    stdin_shutdown.store(true, Ordering::Relaxed);
    drop(raw_mode);
    transport.close().await;

    match outcome {
        AttachOutcome::Detached => eprintln!("\r\n[relay: detached]"),
        AttachOutcome::Exited(Some(code)) => eprintln!("\r\n[relay: exited with {}]", code),
        AttachOutcome::Exited(None) => eprintln!("\r\n[relay: exited]"),
        AttachOutcome::Lost(attempts) => {
            anyhow::bail!("connection lost after {} reconnect attempts", attempts)
        }
    }
    Ok(())
}
