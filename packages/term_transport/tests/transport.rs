use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use term_transport::{
    ClientMessage, ConnectionState, ReconnectPolicy, ServerMessage, TerminalSize,
    TerminalTransport, TransportConfig, TransportEvent,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

type ServerWs = WebSocketStream<TcpStream>;

async fn send(ws: &mut ServerWs, message: ServerMessage) {
    let json = serde_json::to_string(&message).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Echo input back as output until the client goes away
async fn echo(ws: &mut ServerWs) {
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text).unwrap() {
            ClientMessage::Input { data } if data == "exit" => {
                send(ws, ServerMessage::Exit { code: Some(0) }).await;
            }
            ClientMessage::Input { data } => send(ws, ServerMessage::Output { data }).await,
            ClientMessage::Resize { cols, rows } => {
                let data = format!("{}x{}", cols, rows);
                send(ws, ServerMessage::Output { data }).await;
            }
        }
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/terminal/ws", listener.local_addr().unwrap());
    (listener, url)
}

fn fast_config(url: String, max_attempts: u32) -> TransportConfig {
    let mut config = TransportConfig::new(url);
    config.reconnect = ReconnectPolicy {
        initial_interval: Duration::from_millis(10),
        max_attempts,
    };
    config
}

/// Receive events until one matches, returning everything seen
async fn events_until(
    events: &mut mpsc::Receiver<TransportEvent>,
    done: impl Fn(&TransportEvent) -> bool,
) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

#[tokio::test]
async fn handshake_output_and_clean_exit() {
    let (listener, url) = bind().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_server = accepted.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted_server.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            send(&mut ws, ServerMessage::Output { data: "early".into() }).await;
            send(&mut ws, ServerMessage::Connected { id: "pty-1".into() }).await;
            send(&mut ws, ServerMessage::Error { message: "heads up".into() }).await;
            echo(&mut ws).await;
        }
    });

    let (mut transport, mut events) = TerminalTransport::new(fast_config(url, 3));
    let id = transport.connect(TerminalSize::new(100, 30)).await.unwrap();
    assert_eq!(id, "pty-1");
    assert_eq!(transport.state(), ConnectionState::Open);

    let seen = events_until(&mut events, |e| matches!(e, TransportEvent::ServerError(_))).await;
    assert!(!seen.contains(&TransportEvent::Output("early".into())));

    // A server error does not close the connection
    transport.send_input("hello").await.unwrap();
    events_until(&mut events, |e| *e == TransportEvent::Output("hello".into())).await;

    transport.resize(120, 40).await.unwrap();
    events_until(&mut events, |e| *e == TransportEvent::Output("120x40".into())).await;

    transport.send_input("exit").await.unwrap();
    events_until(&mut events, |e| *e == TransportEvent::Exit(Some(0))).await;
    events_until(&mut events, |e| {
        *e == TransportEvent::StateChanged(ConnectionState::Closed)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "exit must not reconnect");
    assert!(transport.send_input("more").await.is_err());
}

#[tokio::test]
async fn reconnects_after_unexpected_close() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut count = 0;
        while let Ok((stream, _)) = listener.accept().await {
            count += 1;
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let id = format!("pty-{}", count);
            send(&mut ws, ServerMessage::Connected { id }).await;
            if count == 1 {
                let _ = ws.close(None).await;
            } else {
                echo(&mut ws).await;
            }
        }
    });

    let (mut transport, mut events) = TerminalTransport::new(fast_config(url, 3));
    assert_eq!(transport.connect(TerminalSize::default()).await.unwrap(), "pty-1");

    let seen = events_until(&mut events, |e| {
        matches!(e, TransportEvent::Reconnected { .. })
    })
    .await;
    assert!(seen.contains(&TransportEvent::StateChanged(
        ConnectionState::Reconnecting { attempt: 1 }
    )));
    assert_eq!(
        seen.last(),
        Some(&TransportEvent::Reconnected {
            session_id: "pty-2".into()
        })
    );

    transport.send_input("again").await.unwrap();
    events_until(&mut events, |e| *e == TransportEvent::Output("again".into())).await;
    assert_eq!(transport.state(), ConnectionState::Open);

    transport.close().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        send(&mut ws, ServerMessage::Connected { id: "pty-1".into() }).await;
        // Dropping the listener and socket refuses every later attempt
        drop(listener);
        let _ = ws.close(None).await;
    });

    let (mut transport, mut events) = TerminalTransport::new(fast_config(url, 3));
    transport.connect(TerminalSize::default()).await.unwrap();

    let seen = events_until(&mut events, |e| matches!(e, TransportEvent::Failed { .. })).await;
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            TransportEvent::StateChanged(ConnectionState::Reconnecting { attempt }) => {
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(seen.last(), Some(&TransportEvent::Failed { attempts: 3 }));

    events_until(&mut events, |e| {
        *e == TransportEvent::StateChanged(ConnectionState::Closed)
    })
    .await;
}

#[tokio::test]
async fn close_suppresses_reconnect() {
    let (listener, url) = bind().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_server = accepted.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted_server.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            send(&mut ws, ServerMessage::Connected { id: "pty".into() }).await;
            echo(&mut ws).await;
        }
    });

    let (mut transport, mut events) = TerminalTransport::new(fast_config(url, 5));
    transport.connect(TerminalSize::default()).await.unwrap();
    transport.close().await;
    assert_eq!(transport.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                TransportEvent::StateChanged(ConnectionState::Reconnecting { .. })
                    | TransportEvent::Reconnected { .. }
            ),
            "unexpected {:?}",
            event
        );
    }
    assert!(transport.send_input("late").await.is_err());
}

#[tokio::test]
async fn close_returns_while_events_are_undrained() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        send(&mut ws, ServerMessage::Connected { id: "pty".into() }).await;
        for i in 0..1000 {
            let data = format!("line {}\r\n", i);
            let json = serde_json::to_string(&ServerMessage::Output { data }).unwrap();
            if ws.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    // The event receiver is held but never read
    let (mut transport, _events) = TerminalTransport::new(fast_config(url, 3));
    transport.connect(TerminalSize::default()).await.unwrap();

    // Let the driver fill the event channel
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), transport.close())
        .await
        .expect("close() must not wait on an undrained event channel");
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(transport.send_input("late").await.is_err());
}
