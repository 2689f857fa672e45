//! Validator & Rate Limiter (C2).
//!
//! Bounds are enforced in order: total frame size, then payload size, then
//! string-field sizes, then `session_id` shape, then per-field length caps,
//! then timestamp skew, then the sliding-window rate limit. The wire codec
//! ([`sigmasockets_protocol`]) already refuses to allocate past
//! [`sigmasockets_protocol::MAX_PAYLOAD_SIZE`] /
//! [`sigmasockets_protocol::MAX_STRING_FIELD`], so this module adds the
//! bounds the codec can't know about: total frame size, session-id shape,
//! per-variant field caps, clock skew, and the rate window itself.

use crate::config::ServerConfig;
use sigmasockets_protocol::{DecodeError, Envelope, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

const SESSION_ID_MAX_LEN: usize = 128;
const CLIENT_VERSION_MAX_LEN: usize = 64;
const DISCONNECT_REASON_MAX_LEN: usize = 256;
const DATA_SKEW: Duration = Duration::from_secs(300);
const HEARTBEAT_SKEW: Duration = Duration::from_secs(60);
const RATE_STATE_EVICT_AFTER: Duration = Duration::from_secs(60);

/// Why a frame was rejected before being handed to the supervisor.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Reject {
    #[error("frame exceeded the {MAX_FRAME_SIZE} byte total-frame cap")]
    FrameTooLarge,
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("session_id must be 1..=128 chars of [A-Za-z0-9_-]")]
    InvalidSessionId,
    #[error("client_version exceeded {CLIENT_VERSION_MAX_LEN} chars")]
    ClientVersionTooLarge,
    #[error("disconnect reason exceeded {DISCONNECT_REASON_MAX_LEN} chars")]
    ReasonTooLarge,
    #[error("timestamp skew exceeded the allowed window")]
    TimestampSkew,
    #[error("client exceeded the sliding-window rate limit")]
    RateLimited,
}

fn is_valid_session_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= SESSION_ID_MAX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn check_skew(timestamp_ms: u64, allowed: Duration) -> bool {
    let now = now_millis();
    let diff = now.abs_diff(timestamp_ms);
    diff <= allowed.as_millis() as u64
}

/// Per-client sliding 1-second window of accepted-message timestamps.
struct RateState {
    samples: VecDeque<Instant>,
    last_touch: Instant,
    abuse_counter: u32,
}

impl RateState {
    fn new(now: Instant) -> Self {
        RateState {
            samples: VecDeque::new(),
            last_touch: now,
            abuse_counter: 0,
        }
    }

    fn allow(&mut self, now: Instant, limit: u32) -> bool {
        self.last_touch = now;
        while let Some(&front) = self.samples.front() {
            if now.duration_since(front) > Duration::from_secs(1) {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.samples.len() as u32 >= limit {
            self.abuse_counter += 1;
            false
        } else {
            self.samples.push_back(now);
            true
        }
    }
}

/// The validator and rate limiter: one process-wide instance shared by
/// every connection.
pub struct Validator {
    config: ServerConfig,
    rate_states: RwLock<HashMap<String, RateState>>,
}

impl Validator {
    pub fn new(config: ServerConfig) -> Self {
        Validator {
            config,
            rate_states: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a raw frame on behalf of `client_id`, enforcing bounds in
    /// the documented order and then the rate limit.
    pub async fn validate(&self, bytes: &[u8], client_id: &str) -> Result<Envelope, Reject> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(Reject::FrameTooLarge);
        }
        let envelope = sigmasockets_protocol::decode(bytes)?;
        self.validate_fields(&envelope)?;
        self.check_rate_limit(client_id).await?;
        Ok(envelope)
    }

    fn validate_fields(&self, envelope: &Envelope) -> Result<(), Reject> {
        match envelope {
            Envelope::Connect {
                session_id,
                client_version,
            } => {
                if !session_id.is_empty() && !is_valid_session_id(session_id) {
                    return Err(Reject::InvalidSessionId);
                }
                if client_version.len() > CLIENT_VERSION_MAX_LEN {
                    return Err(Reject::ClientVersionTooLarge);
                }
            }
            Envelope::Reconnect { session_id, .. } => {
                if !is_valid_session_id(session_id) {
                    return Err(Reject::InvalidSessionId);
                }
            }
            Envelope::Disconnect { reason } => {
                if let Some(r) = reason {
                    if r.len() > DISCONNECT_REASON_MAX_LEN {
                        return Err(Reject::ReasonTooLarge);
                    }
                }
            }
            Envelope::Data {
                payload, timestamp, ..
            } => {
                if payload.len() > MAX_PAYLOAD_SIZE {
                    // sigmasockets_protocol::decode already enforces this, kept
                    // here so callers validating a pre-decoded envelope also
                    // get the bound.
                    return Err(Reject::Decode(DecodeError::PayloadOversize));
                }
                if !check_skew(*timestamp, DATA_SKEW) {
                    return Err(Reject::TimestampSkew);
                }
            }
            Envelope::Heartbeat { timestamp } => {
                if !check_skew(*timestamp, HEARTBEAT_SKEW) {
                    return Err(Reject::TimestampSkew);
                }
            }
            Envelope::Error { message, .. } => {
                if message.len() > sigmasockets_protocol::MAX_STRING_FIELD {
                    return Err(Reject::ReasonTooLarge);
                }
            }
        }
        Ok(())
    }

    async fn check_rate_limit(&self, client_id: &str) -> Result<(), Reject> {
        let now = Instant::now();
        let mut states = self.rate_states.write().await;
        let state = states
            .entry(client_id.to_owned())
            .or_insert_with(|| RateState::new(now));
        if state.allow(now, self.config.rate_limit_per_second) {
            Ok(())
        } else {
            Err(Reject::RateLimited)
        }
    }

    /// Evict rate-limit state untouched for 60s. Run as a lightweight
    /// periodic task alongside session GC.
    pub async fn evict_stale(&self, now: Instant) {
        let mut states = self.rate_states.write().await;
        states.retain(|_, s| now.duration_since(s.last_touch) <= RATE_STATE_EVICT_AFTER);
    }
}

/// Strip control characters from a string before it is written to a log
/// line. The wire payload itself is never mutated.
pub fn sanitize_for_log(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
