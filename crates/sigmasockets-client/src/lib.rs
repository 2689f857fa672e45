//! SigmaSockets client: a resumable WebSocket connection with
//! exponential-backoff reconnect.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use sigmasockets_protocol::{DecodeError, Envelope};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Client-visible connection lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected { session_id: String },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { reason: String },
}

/// Reasons a connect or resume attempt can fail.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("server closed the connection with code {0}")]
    ClosedByServer(u16),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("exceeded the configured maximum reconnect attempts")]
    Exhausted,
}

/// Exponential backoff with +/-20% jitter: `delay = capped +/- 20%`, where
/// `capped = min(max, initial * multiplier^(attempt - 1))`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// The delay before reconnect attempt number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        let jitter_factor = rand::thread_rng().gen_range(0.8..=1.2);
        let jittered = (capped * jitter_factor).min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub client_version: String,
    pub backoff: BackoffPolicy,
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: "ws://localhost:9000/ws".to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            backoff: BackoffPolicy::default(),
            max_attempts: Some(5),
        }
    }
}

/// A resumable connection to a SigmaSockets server.
pub struct SigmaClient {
    config: ClientConfig,
    session_id: Option<String>,
    last_ack_message_id: u64,
    state: ClientState,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl SigmaClient {
    pub fn new(config: ClientConfig) -> Self {
        SigmaClient {
            config,
            session_id: None,
            last_ack_message_id: 0,
            state: ClientState::Disconnected,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Connect fresh (no resume) or resume a prior session if one is known,
    /// performing the handshake and returning the live stream.
    async fn connect_once(&mut self) -> Result<WsStream, ClientError> {
        self.state = ClientState::Connecting;
        let (mut stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;

        let hello = match &self.session_id {
            Some(id) => Envelope::Reconnect {
                session_id: id.clone(),
                last_message_id: self.last_ack_message_id,
            },
            None => Envelope::Connect {
                session_id: String::new(),
                client_version: self.config.client_version.clone(),
            },
        };
        stream
            .send(WsMessage::Binary(sigmasockets_protocol::encode(&hello)))
            .await?;

        let ack = stream
            .next()
            .await
            .ok_or_else(|| ClientError::Handshake("stream closed before handshake ack".into()))??;
        let WsMessage::Binary(bytes) = ack else {
            return Err(ClientError::Handshake("expected a binary ack frame".into()));
        };
        let envelope = sigmasockets_protocol::decode(&bytes)?;
        let assigned = match envelope {
            Envelope::Connect { session_id, .. } if !session_id.is_empty() => session_id,
            Envelope::Reconnect { session_id, .. } => session_id,
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected ack frame: {other:?}"
                )))
            }
        };

        self.session_id = Some(assigned.clone());
        self.state = ClientState::Connected {
            session_id: assigned,
        };
        Ok(stream)
    }

    /// Connect with automatic reconnect-on-failure, driven by
    /// [`BackoffPolicy`]. Returns once a connection succeeds, or
    /// [`ClientError::Exhausted`] once `max_attempts` is spent.
    pub async fn connect_with_retry(&mut self) -> Result<WsStream, ClientError> {
        let mut attempt = 0u32;
        loop {
            match self.connect_once().await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    attempt += 1;
                    if let Some(max) = self.config.max_attempts {
                        if attempt >= max {
                            self.state = ClientState::Failed {
                                reason: err.to_string(),
                            };
                            return Err(ClientError::Exhausted);
                        }
                    }
                    let delay = self.config.backoff.delay_for(attempt);
                    self.state = ClientState::Reconnecting { attempt, delay };
                    tracing::warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "reconnect attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Record that an application message was consumed, advancing the
    /// resume cursor so a future [`Envelope::Reconnect`] only asks for what
    /// was missed.
    pub fn ack(&mut self, message_id: u64) {
        if message_id > self.last_ack_message_id {
            self.last_ack_message_id = message_id;
        }
    }
}
