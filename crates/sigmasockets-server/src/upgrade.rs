//! Upgrade Gate (C6): admission policy layered on top of axum's HTTP/1.1
//! upgrade handshake.
//!
//! axum/hyper already validate `Upgrade`/`Connection`/`Sec-WebSocket-Key`/
//! `-Version`, so this module only adds the checks required on top: origin
//! allow-list, `User-Agent` length floor, and a connection-count ceiling.

use axum::http::HeaderMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::ServerConfig;

/// Why the gate refused an otherwise-valid HTTP upgrade request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Origin {0:?} is not in the configured allow-list")]
    OriginNotAllowed(Option<String>),
    #[error("User-Agent header missing or shorter than the configured minimum")]
    UserAgentTooShort,
    #[error("server is at its configured connection ceiling")]
    AtCapacity,
}

/// Tracks the live connection count so admission can be rejected with a
/// clean 503 rather than accepting a socket the server has nowhere to put.
pub struct ConnectionBudget {
    max_connections: u32,
    current: AtomicU32,
}

impl ConnectionBudget {
    pub fn new(max_connections: u32) -> Self {
        ConnectionBudget {
            max_connections,
            current: AtomicU32::new(0),
        }
    }

    /// Attempt to reserve one connection slot; `Ok(Guard)` releases it on
    /// drop.
    pub fn try_reserve(&self) -> Result<BudgetGuard<'_>, Rejection> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current >= self.max_connections {
                return Err(Rejection::AtCapacity);
            }
            if self
                .current
                .compare_exchange(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(BudgetGuard { budget: self });
            }
        }
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }
}

pub struct BudgetGuard<'a> {
    budget: &'a ConnectionBudget,
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        self.budget.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Evaluate the origin allow-list and `User-Agent` floor against a set of
/// request headers. Does not touch the connection budget.
pub fn check_headers(config: &ServerConfig, headers: &HeaderMap) -> Result<(), Rejection> {
    if !config.allowed_origins.is_empty() {
        let origin = headers
            .get(axum::http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        match &origin {
            Some(o) if config.allowed_origins.iter().any(|a| a == o) => {}
            _ => return Err(Rejection::OriginNotAllowed(origin)),
        }
    }

    if config.min_user_agent_length > 0 {
        let len = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::len)
            .unwrap_or(0);
        if len < config.min_user_agent_length {
            return Err(Rejection::UserAgentTooShort);
        }
    }

    Ok(())
}
