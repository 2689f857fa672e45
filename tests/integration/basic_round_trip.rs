//! Basic round trip: connect, receive an assigned session id, then receive
//! a server-pushed message over the broadcast router. Binds an ephemeral
//! port, spawns the server, and drives it with a real client over real TCP.

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

#[tokio::test]
async fn connect_receives_a_fresh_assigned_session_id() {
    let (addr, _server) = start_server(ServerConfig::default()).await;
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
    match sigmasockets_protocol::decode(&bytes).unwrap() {
        Envelope::Connect { session_id, .. } => assert!(!session_id.is_empty()),
        other => panic!("unexpected ack frame: {other:?}"),
    }
}

#[tokio::test]
async fn a_broadcast_after_connect_is_delivered_to_the_client() {
    let (addr, server) = start_server(ServerConfig::default()).await;
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

    // Give the supervisor a moment to finish attaching before we push.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let outcome = server.broadcaster().send(&session_id, b"push-from-server").await;
    assert_eq!(
        outcome,
        sigmasockets_server::broadcast::DeliveryOutcome::Delivered
    );

    let pushed = ws.next().await.unwrap().unwrap();
    let WsMessage::Binary(pushed_bytes) = pushed else {
        panic!("expected binary push");
    };
    assert_eq!(pushed_bytes, b"push-from-server");
}

#[tokio::test]
async fn health_endpoint_reports_an_ok_status() {
    let (addr, _server) = start_server(ServerConfig::default()).await;
    let url = format!("http://{addr}/health");
    let body = reqwest_get(&url).await;
    assert!(body.contains("\"status\":\"ok\""));
}

/// A minimal GET without pulling in a dedicated HTTP client crate — this
/// workspace already depends on `tokio` for everything else this test needs.
async fn reqwest_get(url: &str) -> String {
    let stripped = url.strip_prefix("http://").unwrap();
    let (host, path) = stripped.split_once('/').unwrap();
    let mut stream = tokio::net::TcpStream::connect(host).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!(
        "GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}
