//! Rate limiting and slow-consumer backpressure: a client that exceeds the
//! sliding-window rate limit is closed with a policy violation, and a
//! session whose outbound queue fills up is closed as a slow consumer
//! rather than left to buffer unboundedly.

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

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
async fn exceeding_the_rate_limit_closes_with_policy_violation() {
    let mut config = ServerConfig::default();
    config.rate_limit_per_second = 5;
    let (addr, _server) = start_server(config).await;
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let heartbeat = sigmasockets_protocol::encode(&Envelope::Heartbeat {
        timestamp: now_millis(),
    });

    for _ in 0..5 {
        ws.send(WsMessage::Binary(heartbeat.clone())).await.unwrap();
    }
    // The 6th frame within the same one-second window trips the limiter.
    ws.send(WsMessage::Binary(heartbeat)).await.unwrap();

    let next = ws.next().await.unwrap().unwrap();
    match next {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(
                frame.code,
                sigmasockets_protocol::close_code::POLICY_VIOLATION.into()
            );
        }
        other => panic!("expected a policy-violation close, got {other:?}"),
    }
}

#[tokio::test]
async fn a_session_whose_queue_fills_up_is_evicted_as_a_slow_consumer() {
    let mut config = ServerConfig::default();
    config.max_queue_frames = 1;
    let (addr, server) = start_server(config).await;
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
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The client never reads, so these fill (and overflow) the queue of
    // capacity 1 without the server blocking on a slow peer.
    for i in 0..5 {
        server
            .broadcaster()
            .send(&session_id, format!("frame-{i}").as_bytes())
            .await;
    }

    // Eventually the supervisor's forced-close notification reaches the
    // socket and the server sends a close frame (possibly after delivering
    // whatever had already made it into the queue before it filled).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "never saw a close frame");
        match tokio::time::timeout(Duration::from_millis(500), ws.next())
            .await
            .ok()
            .flatten()
        {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(
                    frame.code,
                    sigmasockets_protocol::close_code::SLOW_CONSUMER.into()
                );
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected stream result while waiting for close: {other:?}"),
        }
    }
}
