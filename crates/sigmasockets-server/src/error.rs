//! Error taxonomy for the connection supervisor and broadcast router, built
//! as a layered `thiserror` hierarchy.

use crate::rate_limit::Reject;
use sigmasockets_protocol::DecodeError;

/// Errors a Session Registry lookup can fail with.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session with this id exists")]
    NotFound,
    #[error("session existed but was destroyed after sessionTimeout")]
    Expired,
    #[error("connection was replaced by a newer attach on the same session")]
    Replaced,
}

/// Top-level error taxonomy for the connection supervisor and broadcast
/// router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("validate: {0}")]
    Validate(#[from] Reject),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("backpressure: outbound queue full")]
    Backpressure,
    #[error("policy: {0}")]
    Policy(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// The close code a terminal error should close the socket with.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Decode(_) | Error::Validate(_) | Error::Protocol(_) => {
                sigmasockets_protocol::close_code::POLICY_VIOLATION
            }
            Error::Session(SessionError::NotFound) | Error::Session(SessionError::Expired) => {
                sigmasockets_protocol::close_code::SESSION_EXPIRED
            }
            Error::Session(SessionError::Replaced) => {
                sigmasockets_protocol::close_code::SESSION_REPLACED
            }
            Error::Transport(_) => sigmasockets_protocol::close_code::GOING_AWAY,
            Error::Backpressure => sigmasockets_protocol::close_code::SLOW_CONSUMER,
            Error::Policy(_) => sigmasockets_protocol::close_code::POLICY_VIOLATION,
            Error::Internal(_) => sigmasockets_protocol::close_code::INTERNAL_ERROR,
        }
    }
}
