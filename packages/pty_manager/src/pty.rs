use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Terminal type advertised to every spawned shell.
pub const TERM_NAME: &str = "xterm-256color";

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const REAP_ATTEMPTS: usize = 50;
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Options for spawning a shell. Unset fields fall back to platform defaults.
#[derive(Clone, Debug)]
pub struct PtyOptions {
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }
}

impl PtyOptions {
    pub fn resolved_shell(&self) -> String {
        self.shell
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_shell)
    }

    pub fn resolved_cwd(&self) -> PathBuf {
        self.cwd
            .clone()
            .filter(|p| p.is_dir())
            .unwrap_or_else(default_cwd)
    }
}

/// `$SHELL` on unix, `%COMSPEC%` on windows.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}

/// Home directory, else the server's working directory.
pub fn default_cwd() -> PathBuf {
    let home_var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(home_var)
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Output published by a PTY actor. `Exited` is always the last item.
#[derive(Clone, Debug)]
pub enum PtyOutput {
    Data { data: Vec<u8>, timestamp: i64 },
    Exited { exit_code: Option<i32> },
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Kill {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    /// Sent by the reader thread on EOF or read error
    ReaderClosed,
}

/// Handle to communicate with a PTY actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    pid: Option<u32>,
}

impl PtyHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ActorGone)?;
        rx.await.map_err(|_| PtyError::ActorGone)?
    }

    /// Resize the PTY
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                cols,
                rows,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ActorGone)?;
        rx.await.map_err(|_| PtyError::ActorGone)?
    }

    /// Hang up the shell and wait for it to be reaped
    pub async fn kill(&self) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill { respond_to: tx })
            .await
            .map_err(|_| PtyError::ActorGone)?;
        rx.await.map_err(|_| PtyError::ActorGone)?
    }
}

/// The PTY actor that owns a single PTY session
pub(crate) struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    shell: String,
    pid: Option<u32>,
    receiver: mpsc::Receiver<PtyMessage>,
    output_tx: broadcast::Sender<PtyOutput>,
}

impl PtyActor {
    /// Spawn a shell on a fresh PTY.
    ///
    /// The returned receiver is subscribed before the reader thread starts, so
    /// it observes every byte the shell writes.
    pub(crate) fn spawn(
        options: &PtyOptions,
        shell: &str,
        cwd: &std::path::Path,
    ) -> Result<(PtyHandle, broadcast::Receiver<PtyOutput>), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn {
                shell: shell.to_string(),
                reason: format!("failed to open PTY: {:#}", e),
            })?;

        let mut cmd = CommandBuilder::new(shell);
        for arg in &options.args {
            cmd.arg(arg);
        }
        cmd.cwd(cwd);

        cmd.env("TERM", TERM_NAME);
        cmd.env("COLORTERM", "truecolor");

        // Inherit PATH and other essential environment variables
        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY shell: {} with args: {:?} in {}",
            shell,
            options.args,
            cwd.display()
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn shell '{}': {}", shell, e);
            PtyError::Spawn {
                shell: shell.to_string(),
                reason: format!("{:#}", e),
            }
        })?;
        // The slave side belongs to the child now
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let actor = Self {
            master: pair.master,
            writer: None,
            child,
            shell: shell.to_string(),
            pid,
            receiver: msg_rx,
            output_tx: output_tx.clone(),
        };

        let mut reader = actor
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn {
                shell: shell.to_string(),
                reason: format!("failed to clone PTY reader: {:#}", e),
            })?;

        // Blocking thread for reading PTY output
        let reader_msg_tx = msg_tx.clone();
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF detected");
                        break;
                    }
                    Ok(n) => {
                        let output = PtyOutput::Data {
                            data: buffer[..n].to_vec(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let _ = output_tx.send(output);
                    }
                    Err(e) => {
                        // EIO after the child exits is the normal linux path
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
            let _ = reader_msg_tx.blocking_send(PtyMessage::ReaderClosed);
            debug!("PTY reader thread exiting");
        });

        tokio::spawn(actor.run());

        Ok((PtyHandle { sender: msg_tx, pid }, output_rx))
    }

    async fn run(mut self) {
        info!(
            "PTY actor started for shell: {} with PID: {:?}",
            self.shell, self.pid
        );

        // Take the writer immediately to keep the PTY stdin open
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write_input(&data));
                }
                PtyMessage::Resize {
                    cols,
                    rows,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(cols, rows));
                }
                PtyMessage::Kill { respond_to } => {
                    let result = self.handle_kill();
                    let is_ok = result.is_ok();
                    if is_ok {
                        self.finish().await;
                    }
                    let _ = respond_to.send(result);
                    if is_ok {
                        return;
                    }
                }
                PtyMessage::ReaderClosed => {
                    self.finish().await;
                    return;
                }
            }
        }

        // Every sender is gone, including the reader's
        let _ = self.child.kill();
        self.finish().await;
    }

    /// Reap the child and publish the terminal `Exited` output.
    async fn finish(&mut self) {
        let exit_code = self.reap().await;
        info!("PTY process {:?} exited with code {:?}", self.pid, exit_code);
        let _ = self.output_tx.send(PtyOutput::Exited { exit_code });
    }

    async fn reap(&mut self) -> Option<i32> {
        for _ in 0..REAP_ATTEMPTS {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status.exit_code() as i32),
                Ok(None) => tokio::time::sleep(REAP_INTERVAL).await,
                Err(e) => {
                    warn!("Failed to poll PTY child: {}", e);
                    return None;
                }
            }
        }

        warn!("PTY child {:?} ignored hangup, forcing kill", self.pid);
        let _ = self.child.kill();
        self.child
            .wait()
            .ok()
            .map(|status| status.exit_code() as i32)
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "PTY writer closed")
            })?;

        writer.write_all(data)?;
        writer.flush()?;

        Ok(data.len())
    }

    fn handle_resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize {
                cols,
                rows,
                reason: format!("{:#}", e),
            })
    }

    fn handle_kill(&mut self) -> Result<(), PtyError> {
        // Interactive shells ignore SIGTERM, so hang up like a closing terminal
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                match kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => return Ok(()),
                    Err(e) => return Err(PtyError::Kill(e.to_string())),
                }
            }
        }

        self.child
            .kill()
            .map_err(|e| PtyError::Kill(e.to_string()))
    }
}
