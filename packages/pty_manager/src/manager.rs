use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::PtyError;
use crate::pty::{PtyActor, PtyHandle, PtyOptions, PtyOutput};

const SESSION_CHANNEL_CAPACITY: usize = 1024;

/// Public description of a live PTY session
#[derive(Clone, Debug)]
pub struct PtySession {
    pub id: String,
    pub pid: Option<u32>,
    pub shell: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A freshly spawned session plus a receiver that has seen all of its output
pub struct SpawnedPty {
    pub session: PtySession,
    pub output: broadcast::Receiver<PtyOutput>,
}

/// Internal state for a managed PTY
struct ManagedPty {
    session: PtySession,
    handle: PtyHandle,
    output_tx: broadcast::Sender<PtyOutput>,
}

/// Registry of live PTY sessions keyed by id.
///
/// Shared across connections behind an `Arc`; every operation other than
/// [`PtyManager::spawn`] reports [`PtyError::NotFound`] for unknown ids.
pub struct PtyManager {
    sessions: Arc<RwLock<HashMap<String, ManagedPty>>>,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn a new shell session
    pub async fn spawn(&self, options: PtyOptions) -> Result<SpawnedPty, PtyError> {
        let shell = options.resolved_shell();
        let cwd = options.resolved_cwd();

        let (handle, mut actor_rx) = PtyActor::spawn(&options, &shell, &cwd)?;
        let (output_tx, output_rx) = broadcast::channel(SESSION_CHANNEL_CAPACITY);

        let session = {
            let mut sessions = self.sessions.write().await;
            let mut id = uuid::Uuid::new_v4().to_string();
            while sessions.contains_key(&id) {
                id = uuid::Uuid::new_v4().to_string();
            }

            let session = PtySession {
                id: id.clone(),
                pid: handle.pid(),
                shell,
                cwd,
                created_at: Utc::now(),
            };
            sessions.insert(
                id,
                ManagedPty {
                    session: session.clone(),
                    handle,
                    output_tx: output_tx.clone(),
                },
            );
            session
        };

        info!("PTY session {} spawned ({})", session.id, session.shell);

        // Forward actor output to session subscribers; drop the entry on exit
        let sessions = self.sessions.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            loop {
                match actor_rx.recv().await {
                    Ok(PtyOutput::Data { data, timestamp }) => {
                        let _ = output_tx.send(PtyOutput::Data { data, timestamp });
                    }
                    Ok(PtyOutput::Exited { exit_code }) => {
                        sessions.write().await.remove(&id);
                        let _ = output_tx.send(PtyOutput::Exited { exit_code });
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("PTY session {} dropped {} output chunks", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        sessions.write().await.remove(&id);
                        let _ = output_tx.send(PtyOutput::Exited { exit_code: None });
                        break;
                    }
                }
            }
            debug!("PTY session {} forwarder finished", id);
        });

        Ok(SpawnedPty {
            session,
            output: output_rx,
        })
    }

    /// Write data to a session's shell
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<usize, PtyError> {
        let handle = self.handle(id).await?;
        handle.write(data).await
    }

    /// Resize a session's terminal
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        let handle = self.handle(id).await?;
        handle.resize(cols, rows).await
    }

    /// Remove a session and hang up its shell.
    ///
    /// Every teardown path (explicit kill, socket close, disconnect) goes
    /// through here; a session that already exited reports `NotFound`.
    pub async fn kill(&self, id: &str) -> Result<(), PtyError> {
        let managed = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PtyError::NotFound(id.to_string()))?;

        info!("Killing PTY session {}", id);
        match managed.handle.kill().await {
            Ok(()) => Ok(()),
            // The actor already reaped the child on its own
            Err(PtyError::ActorGone) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Kill every live session, returning how many were torn down
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<ManagedPty> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, managed)| managed)
            .collect();

        let count = drained.len();
        for managed in drained {
            if let Err(e) = managed.handle.kill().await {
                warn!("Failed to kill PTY session {}: {}", managed.session.id, e);
            }
        }
        if count > 0 {
            info!("Killed {} PTY sessions", count);
        }
        count
    }

    /// Subscribe to a session's output from this point on
    pub async fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<PtyOutput>, PtyError> {
        let sessions = self.sessions.read().await;
        let managed = sessions
            .get(id)
            .ok_or_else(|| PtyError::NotFound(id.to_string()))?;
        Ok(managed.output_tx.subscribe())
    }

    pub async fn get(&self, id: &str) -> Option<PtySession> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|managed| managed.session.clone())
    }

    /// List all live sessions
    pub async fn list(&self) -> Vec<PtySession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|managed| managed.session.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn handle(&self, id: &str) -> Result<PtyHandle, PtyError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|managed| managed.handle.clone())
            .ok_or_else(|| PtyError::NotFound(id.to_string()))
    }
}
