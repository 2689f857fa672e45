//! Reconnect-with-replay: a session that drops its socket and resumes later
//! gets exactly the frames it missed, in order, never a frame it already
//! acknowledged.

use futures_util::{SinkExt, StreamExt};
use sigmasockets_protocol::Envelope;
use sigmasockets_server::{ServerConfig, SigmaServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn start_server(config: ServerConfig) -> (SocketAddr, Arc<SigmaServer>) {
    let server = Arc::new(SigmaServer::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let spawned = server.clone();
    tokio::spawn(async move {
        spawned.serve_on(listener).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, server)
}

async fn connect_and_handshake(
    addr: SocketAddr,
) -> (
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    String,
) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(WsMessage::Binary(sigmasockets_protocol::encode(
        &Envelope::Connect {
            session_id: String::new(),
            client_version: "test-client/1.0".into(),
        },
    )))
    .await
    .unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    let WsMessage::Binary(bytes) = ack else {
        panic!("expected binary ack");
    };
    let Envelope::Connect { session_id, .. } = sigmasockets_protocol::decode(&bytes).unwrap() else {
        panic!("expected Connect ack");
    };
    (ws, session_id)
}

#[tokio::test]
async fn a_resumed_session_receives_only_frames_sent_while_it_was_detached() {
    let (addr, server) = start_server(ServerConfig::default()).await;
    let (mut ws, session_id) = connect_and_handshake(addr).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One message is delivered and acked live.
    server.broadcaster().send(&session_id, b"seen-live").await;
    let first = ws.next().await.unwrap().unwrap();
    let WsMessage::Binary(first_bytes) = first else {
        panic!("expected binary push");
    };
    assert_eq!(first_bytes, b"seen-live");

    // Client disconnects without acking via Reconnect yet.
    drop(ws);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Two more messages are pushed while nobody is attached.
    server.broadcaster().send(&session_id, b"missed-1").await;
    server.broadcaster().send(&session_id, b"missed-2").await;

    // Resume, telling the server we'd already seen message 1 (seen-live).
    let url = format!("ws://{addr}/ws");
    let (mut ws2, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws2.send(WsMessage::Binary(sigmasockets_protocol::encode(
        &Envelope::Reconnect {
            session_id: session_id.clone(),
            last_message_id: 1,
        },
    )))
    .await
    .unwrap();

    let replay_1 = ws2.next().await.unwrap().unwrap();
    let replay_2 = ws2.next().await.unwrap().unwrap();
    let WsMessage::Binary(b1) = replay_1 else {
        panic!("expected binary replay frame")
    };
    let WsMessage::Binary(b2) = replay_2 else {
        panic!("expected binary replay frame")
    };
    assert_eq!(b1, b"missed-1");
    assert_eq!(b2, b"missed-2");
}

#[tokio::test]
async fn reconnecting_to_an_unknown_session_id_closes_with_session_expired() {
    let (addr, _server) = start_server(ServerConfig::default()).await;
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(WsMessage::Binary(sigmasockets_protocol::encode(
        &Envelope::Reconnect {
            session_id: "0".repeat(32),
            last_message_id: 0,
        },
    )))
    .await
    .unwrap();

    let next = ws.next().await.unwrap().unwrap();
    match next {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(frame.code, sigmasockets_protocol::close_code::SESSION_EXPIRED.into());
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}
