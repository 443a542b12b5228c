use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use pty_manager::PtyOutput;
use term_transport::{ClientMessage, ServerMessage};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::config::TerminalOverrides;

/// Open a shell for this connection: `GET /api/terminal/ws?cols&rows&cwd`
pub async fn terminal_ws_handler(
    State(state): State<AppState>,
    Query(overrides): Query<TerminalOverrides>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(origin) = check_origin(&headers, &state.config.server.allowed_origins) {
        warn!("Refusing terminal upgrade from origin {:?}", origin);
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_terminal(socket, state, overrides))
}

/// Browsers always send `Origin` on a WebSocket upgrade and CORS does not
/// apply, so a page from another site must be turned away here. Clients
/// that send no `Origin` (the attach CLI) are not browsers and pass.
///
/// Returns the offending origin on rejection.
fn check_origin(headers: &HeaderMap, allowed_origins: &[String]) -> Result<(), String> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };
    let origin = origin
        .to_str()
        .map_err(|_| String::from_utf8_lossy(origin.as_bytes()).into_owned())?;

    if allowed_origins.iter().any(|allowed| allowed == origin) {
        return Ok(());
    }

    // Same origin: scheme://host[:port] naming the host this request came to
    let origin_authority = origin.split_once("://").map(|(_, rest)| rest);
    let host = headers.get(header::HOST).and_then(|h| h.to_str().ok());
    match (origin_authority, host) {
        (Some(authority), Some(host)) if authority.eq_ignore_ascii_case(host) => Ok(()),
        _ => Err(origin.to_string()),
    }
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut WsSender, state: &AppState, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode terminal message: {}", e);
            return true;
        }
    };
    match sender.send(Message::Text(json.into())).await {
        Ok(()) => {
            state.metrics.message_sent();
            true
        }
        Err(e) => {
            debug!("Terminal client went away: {}", e);
            false
        }
    }
}

async fn handle_terminal(socket: WebSocket, state: AppState, overrides: TerminalOverrides) {
    state.metrics.connection_opened();
    let (mut sender, mut receiver) = socket.split();

    let options = state.config.terminal.pty_options(&overrides);
    let spawned = match state.pty_manager.spawn(options).await {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to spawn terminal: {}", e);
            state.metrics.pty_error();
            let message = ServerMessage::Error {
                message: format!("Failed to start shell: {}", e),
            };
            send(&mut sender, &state, &message).await;
            let _ = sender.close().await;
            state.metrics.connection_closed();
            return;
        }
    };

    let id = spawned.session.id.clone();
    let mut output = spawned.output;
    state.metrics.session_created();
    info!("Terminal {} attached ({})", id, spawned.session.shell);

    let mut exited = false;
    let mut carry = Utf8Carry::default();

    if send(
        &mut sender,
        &state,
        &ServerMessage::Connected { id: id.clone() },
    )
    .await
    {
        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Ok(PtyOutput::Data { data, .. }) => {
                        let text = carry.push(&data);
                        if !text.is_empty()
                            && !send(&mut sender, &state, &ServerMessage::Output { data: text }).await
                        {
                            break;
                        }
                    }
                    Ok(PtyOutput::Exited { exit_code }) => {
                        exited = true;
                        let rest = carry.finish();
                        if !rest.is_empty() {
                            send(&mut sender, &state, &ServerMessage::Output { data: rest }).await;
                        }
                        send(&mut sender, &state, &ServerMessage::Exit { code: exit_code }).await;
                        let _ = sender.close().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Terminal {} lagged, dropped {} chunks", id, skipped);
                        state.metrics.messages_dropped(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        exited = true;
                        send(&mut sender, &state, &ServerMessage::Exit { code: None }).await;
                        break;
                    }
                },
                message = receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        state.metrics.message_received();
                        if let Some(reply) = apply_client_message(&state, &id, &text).await {
                            if !send(&mut sender, &state, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.metrics.message_received();
                        state.metrics.malformed_message();
                        let reply = ServerMessage::Error {
                            message: "Invalid message: binary frames are not supported".into(),
                        };
                        if !send(&mut sender, &state, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Terminal {} client closed", id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Terminal {} WebSocket error: {}", id, e);
                        state.metrics.websocket_error();
                        break;
                    }
                },
            }
        }
    }

    // Every way out of the loop ends the shell
    if !exited {
        match state.pty_manager.kill(&id).await {
            Ok(()) => info!("Terminal {} killed on disconnect", id),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Failed to kill terminal {}: {}", id, e);
                state.metrics.pty_error();
            }
        }
    }
    state.metrics.session_ended(exited);
    state.metrics.connection_closed();
}

/// Apply one client message; the return value is sent back to the client
async fn apply_client_message(state: &AppState, id: &str, text: &str) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Malformed terminal message on {}: {}", id, e);
            state.metrics.malformed_message();
            return Some(ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            });
        }
    };

    let result = match message {
        ClientMessage::Input { data } => state
            .pty_manager
            .write(id, data.as_bytes())
            .await
            .map(|_| ()),
        ClientMessage::Resize { cols, rows } => state.pty_manager.resize(id, cols, rows).await,
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            warn!("Terminal {} operation failed: {}", id, e);
            state.metrics.pty_error();
            Some(ServerMessage::Error {
                message: e.to_string(),
            })
        }
    }
}

/// Holds back an incomplete UTF-8 sequence at the end of a chunk until the
/// rest of it arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let byte = bytes[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}
