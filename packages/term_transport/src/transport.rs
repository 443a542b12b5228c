use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::{Result, TransportError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::surface::TerminalSize;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Waiting for or making reconnect attempt `attempt` (from 1)
    Reconnecting { attempt: u32 },
    Closed,
}

/// Everything the transport reports back to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Output(String),
    /// The remote shell exited; the transport is closed and will not reconnect
    Exit(Option<i32>),
    /// The server reported a problem; the connection stays up
    ServerError(String),
    StateChanged(ConnectionState),
    /// A new remote session replaced the lost one
    Reconnected { session_id: String },
    /// Every reconnect attempt failed
    Failed { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:7890/api/terminal/ws`
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Endpoint with the terminal size as query parameters
    pub fn session_url(&self, size: TerminalSize) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}cols={}&rows={}",
            self.url, separator, size.cols, size.rows
        )
    }
}

/// State and event fan-out shared by the handle and its driver
#[derive(Clone)]
struct Signals {
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Signals {
    async fn transition(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Transport {:?} -> {:?}", previous, state);
            self.emit(TransportEvent::StateChanged(state)).await;
        }
    }

    /// Deliver an event, giving up once the transport is closed.
    ///
    /// After cancellation events are only queued if there is room, so an
    /// owner that stopped draining cannot hold up `close()`.
    async fn emit(&self, event: TransportEvent) {
        if self.cancel.is_cancelled() {
            let _ = self.events.try_send(event);
            return;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => debug!("Dropping event after close"),
            // Nobody listening is fine
            _ = self.events.send(event) => {}
        }
    }
}

/// Client side of a remote terminal session.
///
/// After [`TerminalTransport::connect`] a background driver owns the socket:
/// it forwards input and resizes, publishes [`TransportEvent`]s, and
/// reconnects with exponential backoff when the connection drops without
/// [`TerminalTransport::close`] having been called.
pub struct TerminalTransport {
    config: TransportConfig,
    signals: Signals,
    state_rx: watch::Receiver<ConnectionState>,
    commands: Option<mpsc::Sender<ClientMessage>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl TerminalTransport {
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let cancel = CancellationToken::new();
        let transport = Self {
            config,
            signals: Signals {
                state: Arc::new(state_tx),
                events: events_tx,
                cancel: cancel.clone(),
            },
            state_rx,
            commands: None,
            cancel,
            driver: None,
        };
        (transport, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Open the socket and wait for the server's `connected` message.
    ///
    /// Returns the remote session id.
    pub async fn connect(&mut self, size: TerminalSize) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.driver.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        self.signals.transition(ConnectionState::Connecting).await;
        let url = self.config.session_url(size);
        let (ws, session_id) = match open_session(&url, self.config.handshake_timeout).await {
            Ok(opened) => opened,
            Err(e) => {
                self.signals.transition(ConnectionState::Idle).await;
                return Err(e);
            }
        };
        info!("Terminal session {} connected via {}", session_id, self.config.url);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let driver = Driver {
            config: self.config.clone(),
            signals: self.signals.clone(),
            cancel: self.cancel.clone(),
            commands: commands_rx,
            ws,
            size,
        };

        self.signals.transition(ConnectionState::Open).await;
        self.commands = Some(commands_tx);
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(session_id)
    }

    pub async fn send_input(&self, data: impl Into<String>) -> Result<()> {
        self.send(ClientMessage::Input { data: data.into() }).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(ClientMessage::Resize { cols, rows }).await
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let commands = self.commands.as_ref().ok_or(TransportError::Closed)?;
        commands
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close for good. No reconnect happens after this, even if the socket
    /// reports an error while it is shutting down.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.commands = None;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!("Terminal transport driver failed: {}", e);
            }
        }
        self.signals.transition(ConnectionState::Closed).await;
    }
}

impl Drop for TerminalTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn open_session(url: &str, handshake_timeout: Duration) -> Result<(WsStream, String)> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    let session_id = tokio::time::timeout(handshake_timeout, handshake(&mut ws))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    Ok((ws, session_id))
}

/// Read until `connected`; anything before it is not part of the session
async fn handshake(ws: &mut WsStream) -> Result<String> {
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Connected { id }) => return Ok(id),
                Ok(other) => debug!("Ignoring {:?} before handshake", other),
                Err(e) => debug!("Ignoring malformed message before handshake: {}", e),
            },
            Message::Close(_) => return Err(TransportError::HandshakeClosed),
            _ => {}
        }
    }
    Err(TransportError::HandshakeClosed)
}

/// Why one socket stopped being pumped
enum Ending {
    Cancelled,
    Exited,
    Lost,
}

struct Driver {
    config: TransportConfig,
    signals: Signals,
    cancel: CancellationToken,
    commands: mpsc::Receiver<ClientMessage>,
    ws: WsStream,
    size: TerminalSize,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.pump().await {
                Ending::Cancelled | Ending::Exited => break,
                Ending::Lost if self.cancel.is_cancelled() => break,
                Ending::Lost => match self.reconnect().await {
                    Some(ws) => self.ws = ws,
                    None => break,
                },
            }
        }
        self.signals.transition(ConnectionState::Closed).await;
    }

    async fn pump(&mut self) -> Ending {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
                    return Ending::Cancelled;
                }
                command = self.commands.recv() => match command {
                    Some(message) => {
                        if let ClientMessage::Resize { cols, rows } = message {
                            self.size = TerminalSize::new(cols, rows);
                        }
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to encode {:?}: {}", message, e);
                                continue;
                            }
                        };
                        if let Err(e) = self.ws.send(Message::Text(json.into())).await {
                            warn!("Terminal send failed: {}", e);
                            return Ending::Lost;
                        }
                    }
                    // Handle dropped without close()
                    None => {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
                        return Ending::Cancelled;
                    }
                },
                message = self.ws.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Output { data }) => {
                                self.signals.emit(TransportEvent::Output(data)).await;
                            }
                            Ok(ServerMessage::Exit { code }) => {
                                info!("Remote shell exited with {:?}", code);
                                self.signals.emit(TransportEvent::Exit(code)).await;
                                let _ = self.ws.close(None).await;
                                return Ending::Exited;
                            }
                            Ok(ServerMessage::Error { message }) => {
                                self.signals.emit(TransportEvent::ServerError(message)).await;
                            }
                            Ok(ServerMessage::Connected { id }) => {
                                debug!("Unexpected second handshake for {}", id);
                            }
                            Err(e) => warn!("Malformed terminal message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ending::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Terminal connection error: {}", e);
                        return Ending::Lost;
                    }
                },
            }
        }
    }

    /// Retry with backoff; `None` when cancelled or out of attempts
    async fn reconnect(&mut self) -> Option<WsStream> {
        let policy = self.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            self.signals
                .transition(ConnectionState::Reconnecting { attempt })
                .await;

            let delay = policy.delay(attempt);
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let url = self.config.session_url(self.size);
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                opened = open_session(&url, self.config.handshake_timeout) => opened,
            };

            match opened {
                Ok((ws, session_id)) => {
                    info!("Reconnected as terminal session {}", session_id);
                    self.signals
                        .emit(TransportEvent::Reconnected { session_id })
                        .await;
                    self.signals.transition(ConnectionState::Open).await;
                    return Some(ws);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        warn!(
            "Giving up on {} after {} attempts",
            self.config.url, policy.max_attempts
        );
        self.signals
            .emit(TransportEvent::Failed {
                attempts: policy.max_attempts,
            })
            .await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_appends_size() {
        let config = TransportConfig::new("ws://localhost:7890/api/terminal/ws");
        assert_eq!(
            config.session_url(TerminalSize::new(120, 40)),
            "ws://localhost:7890/api/terminal/ws?cols=120&rows=40"
        );

        let config = TransportConfig::new("ws://localhost/ws?cwd=/srv");
        assert_eq!(
            config.session_url(TerminalSize::default()),
            "ws://localhost/ws?cwd=/srv&cols=80&rows=24"
        );
    }

    #[tokio::test]
    async fn send_before_connect_is_closed() {
        let (transport, _events) = TerminalTransport::new(TransportConfig::new("ws://unused"));
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(matches!(
            transport.send_input("ls").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn connect_after_close_is_refused() {
        let (mut transport, _events) = TerminalTransport::new(TransportConfig::new("ws://unused"));
        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(matches!(
            transport.connect(TerminalSize::default()).await,
            Err(TransportError::Closed)
        ));
    }
}
