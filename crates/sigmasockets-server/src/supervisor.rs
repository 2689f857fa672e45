//! Connection Supervisor (C7): the per-connection read/write loop.
//!
//! A `tokio::select!` loop over the socket's read half, a command/outbound
//! channel, a heartbeat `interval`, and a shutdown signal. Binary frames are
//! decoded through the validator (C2), dispatched against the session
//! registry (C3), and the keep-alive/quality engines (C4/C5) are updated on
//! every heartbeat round-trip.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::events::{ConnectionEvent, EventHub};
use crate::keepalive::{HealthState, KeepAlive};
use crate::rate_limit::Validator;
use crate::session::SessionRegistry;
use sigmasockets_protocol::{close_code, encode, Envelope};

/// How long a sent ping may go unanswered before it counts as missed.
const PONG_DEADLINE: Duration = Duration::from_secs(10);

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drives one accepted WebSocket connection end to end: handshake, steady
/// state, and teardown. Returns once the socket closes or shutdown fires.
pub async fn run_connection(
    socket: WebSocket,
    client_id: String,
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    validator: Arc<Validator>,
    events: EventHub,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(config.max_queue_frames);

    let mut session_id: Option<String> = None;
    let mut keepalive = KeepAlive::new(
        config.heartbeat_interval,
        config.min_heartbeat_interval,
        config.max_heartbeat_interval,
        config.adaptive_heartbeat_enabled,
        config.connection_quality_threshold,
    );
    let mut last_activity = Instant::now();
    let mut ping_interval = config.min_heartbeat_interval.min(Duration::from_millis(500));
    let mut ping_ticker = tokio::time::interval(ping_interval);
    let mut close_code_to_send: Option<u16> = None;
    let mut close_notify: Option<Arc<tokio::sync::Notify>> = None;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    close_code_to_send = Some(close_code::GOING_AWAY);
                    break;
                }
            }
            _ = wait_for_notify(&close_notify) => {
                close_code_to_send = Some(close_code::SLOW_CONSUMER);
                break;
            }
            _ = ping_ticker.tick() => {
                if let Some(sent_at) = keepalive.last_ping_sent_at() {
                    if sent_at.elapsed() >= PONG_DEADLINE {
                        keepalive.record_missed_pong();
                        if let Some(id) = &session_id {
                            if let Ok(session) = registry.get(id).await {
                                session.lock().await.quality.record_missed_ping();
                            }
                        }
                        if keepalive.state() == HealthState::Unhealthy {
                            close_code_to_send = Some(close_code::INTERNAL_ERROR);
                            break;
                        }
                    }
                }

                let idle = last_activity.elapsed();
                if keepalive.should_ping(idle, config.max_idle_time) {
                    keepalive.note_idle(idle, config.load_balancer_timeout);
                    if let Some(id) = &session_id {
                        if let Ok(session) = registry.get(id).await {
                            let mut guard = session.lock().await;
                            let now = Instant::now();
                            guard.quality.record_ping_sent(now);
                            keepalive.record_ping_sent(now);
                            keepalive.adapt_interval(guard.quality.score());
                            let hb = encode(&Envelope::Heartbeat { timestamp: now_millis() });
                            if guard.try_send(hb).is_err() {
                                drop(guard);
                                registry.detach(id).await;
                                close_code_to_send = Some(close_code::SLOW_CONSUMER);
                                break;
                            }
                        }
                    }
                }

                let desired_interval = keepalive.current_interval();
                if desired_interval != ping_interval {
                    ping_interval = desired_interval;
                    ping_ticker = tokio::time::interval(ping_interval);
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else {
                    break;
                };
                match incoming {
                    Ok(Message::Binary(bytes)) => {
                        last_activity = Instant::now();
                        match handle_frame(
                            &bytes,
                            &client_id,
                            &mut session_id,
                            &config,
                            &registry,
                            &validator,
                            &events,
                            &outbound_tx,
                            &mut keepalive,
                        ).await {
                            Ok(None) => {
                                if let Some(id) = &session_id {
                                    if close_notify.is_none() {
                                        if let Ok(session) = registry.get(id).await {
                                            close_notify = Some(session.lock().await.close_notify());
                                        }
                                    }
                                }
                            }
                            Ok(Some(code)) => {
                                close_code_to_send = Some(code);
                                break;
                            }
                            Err(err) => {
                                close_code_to_send = Some(err.close_code());
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Text(_)) => {
                        debug!(client_id, "rejecting text frame: binary-only wire format");
                        close_code_to_send = Some(close_code::POLICY_VIOLATION);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(client_id, error = %err, "websocket transport error");
                        break;
                    }
                }
            }
        }
    }

    if let Some(id) = &session_id {
        registry.detach(id).await;
        events.publish(ConnectionEvent::Disconnected {
            session_id: id.clone(),
            code: close_code_to_send.unwrap_or(close_code::NORMAL),
        });
    }

    let code = close_code_to_send.unwrap_or(close_code::NORMAL);
    let _ = ws_tx
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: std::borrow::Cow::Borrowed(""),
        })))
        .await;
}

/// Dispatch one decoded-or-rejected frame against the session registry.
/// `Err` tells the caller to close the socket with that error's close code.
#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    bytes: &[u8],
    client_id: &str,
    session_id: &mut Option<String>,
    config: &ServerConfig,
    registry: &SessionRegistry,
    validator: &Validator,
    events: &EventHub,
    outbound_tx: &mpsc::Sender<Vec<u8>>,
    keepalive: &mut KeepAlive,
) -> Result<Option<u16>, Error> {
    let envelope = match validator.validate(bytes, client_id).await {
        Ok(e) => e,
        Err(err) => {
            warn!(client_id, error = %err, "frame rejected by validator");
            return Err(Error::Validate(err));
        }
    };

    match envelope {
        Envelope::Connect {
            session_id: requested,
            client_version,
        } if requested.is_empty() => {
            let (new_id, _session) = registry
                .create(
                    client_version,
                    fresh_keepalive(config),
                    config.latency_window_size as usize,
                    config.replay_capacity as usize,
                )
                .await;
            registry
                .attach(&new_id, outbound_tx.clone())
                .await?;
            let ack = encode(&Envelope::Connect {
                session_id: new_id.clone(),
                client_version: String::new(),
            });
            let _ = outbound_tx.send(ack).await;
            events.publish(ConnectionEvent::Connected {
                session_id: new_id.clone(),
                resumed: false,
            });
            info!(session_id = %new_id, "new session established");
            *session_id = Some(new_id);
            keepalive.record_activity();
            Ok(None)
        }
        Envelope::Connect { .. } => Err(Error::Protocol(
            "Connect with a non-empty session_id is only valid as the server's own ack".into(),
        )),
        Envelope::Reconnect {
            session_id: requested,
            last_message_id,
        } => {
            let session = registry.get(&requested).await?;
            registry.attach(&requested, outbound_tx.clone()).await?;
            let replay = {
                let mut guard = session.lock().await;
                guard.last_ack_message_id = last_message_id;
                guard.replay_since(last_message_id)
            };
            for frame in replay {
                if outbound_tx.send(frame).await.is_err() {
                    return Err(Error::Backpressure);
                }
            }
            events.publish(ConnectionEvent::Connected {
                session_id: requested.clone(),
                resumed: true,
            });
            info!(session_id = %requested, replayed = true, "session resumed");
            *session_id = Some(requested);
            keepalive.record_activity();
            Ok(None)
        }
        Envelope::Data {
            payload,
            message_id,
            ..
        } => {
            let Some(id) = session_id.as_ref() else {
                return Err(Error::Protocol(
                    "Data frame received before a session was established".into(),
                ));
            };
            keepalive.record_activity();
            events.publish(ConnectionEvent::Message {
                session_id: id.clone(),
                message_id,
                bytes: payload.len(),
            });
            Ok(None)
        }
        Envelope::Heartbeat { .. } => {
            keepalive.record_activity();
            if let Some(id) = session_id.as_ref() {
                if let Ok(session) = registry.get(id).await {
                    session.lock().await.quality.record_pong_received(Instant::now());
                }
            }
            Ok(None)
        }
        Envelope::Disconnect { .. } => Ok(Some(close_code::NORMAL)),
        Envelope::Error { code, message } => {
            warn!(client_id, code, message, "client reported an error");
            events.publish(ConnectionEvent::Error {
                session_id: session_id.clone(),
                message,
            });
            Ok(None)
        }
    }
}

/// Waits on a session's forced-close notifier if one is attached yet,
/// otherwise never resolves — lets the `select!` loop fold an optional
/// signal in without a separate branch per connection state.
async fn wait_for_notify(notify: &Option<Arc<tokio::sync::Notify>>) {
    match notify {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}

fn fresh_keepalive(config: &ServerConfig) -> KeepAlive {
    KeepAlive::new(
        config.heartbeat_interval,
        config.min_heartbeat_interval,
        config.max_heartbeat_interval,
        config.adaptive_heartbeat_enabled,
        config.connection_quality_threshold,
    )
}
