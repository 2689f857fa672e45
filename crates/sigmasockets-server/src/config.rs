//! Server configuration.
//!
//! A typed struct with a documented default for every field; a value that
//! violates an internal ordering constraint is corrected in place with a
//! logged warning rather than rejected outright — configuration errors
//! should not prevent a degraded-but-running server.

use std::time::Duration;
use tracing::warn;

/// A pluggable HTTP handler invoked for any request that isn't the
/// WebSocket upgrade route or the health endpoint. `Infallible` because a
/// handler that can't produce a response should produce an error response
/// instead.
pub type RequestHandler = tower::util::BoxCloneService<
    axum::extract::Request,
    axum::response::Response,
    std::convert::Infallible,
>;

/// Top-level server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub heartbeat_interval: Duration,
    pub min_heartbeat_interval: Duration,
    pub max_heartbeat_interval: Duration,
    pub adaptive_heartbeat_enabled: bool,
    pub connection_quality_threshold: f32,
    pub latency_window_size: u32,
    pub session_timeout: Duration,
    pub max_connections: u32,
    pub buffer_size: usize,
    pub replay_capacity: u32,
    pub load_balancer_timeout: Duration,
    pub max_idle_time: Duration,
    pub tcp_keepalive_enabled: bool,
    /// Max outbound frames queued per connection before it is treated as a
    /// slow consumer.
    pub max_queue_frames: usize,
    /// Max outbound bytes queued per connection before it is treated as a
    /// slow consumer.
    pub max_queue_bytes: usize,
    /// Max messages accepted per client per second.
    pub rate_limit_per_second: u32,
    /// Deadline for draining outbound queues during graceful shutdown.
    pub shutdown_drain_timeout: Duration,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// Allow-listed `Origin` header values; empty means no origin policy.
    pub allowed_origins: Vec<String>,
    /// Minimum accepted `User-Agent` header length; 0 disables the check.
    pub min_user_agent_length: usize,
    /// Whether responses should carry `Strict-Transport-Security` (set this
    /// when the server sits directly behind TLS termination it controls).
    pub tls_enabled: bool,
    /// Optional fallback HTTP handler for any request outside `/ws` and
    /// `/health`. `None` serves a plain 404.
    pub request_handler: Option<RequestHandler>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("min_heartbeat_interval", &self.min_heartbeat_interval)
            .field("max_heartbeat_interval", &self.max_heartbeat_interval)
            .field("adaptive_heartbeat_enabled", &self.adaptive_heartbeat_enabled)
            .field("connection_quality_threshold", &self.connection_quality_threshold)
            .field("latency_window_size", &self.latency_window_size)
            .field("session_timeout", &self.session_timeout)
            .field("max_connections", &self.max_connections)
            .field("buffer_size", &self.buffer_size)
            .field("replay_capacity", &self.replay_capacity)
            .field("load_balancer_timeout", &self.load_balancer_timeout)
            .field("max_idle_time", &self.max_idle_time)
            .field("tcp_keepalive_enabled", &self.tcp_keepalive_enabled)
            .field("max_queue_frames", &self.max_queue_frames)
            .field("max_queue_bytes", &self.max_queue_bytes)
            .field("rate_limit_per_second", &self.rate_limit_per_second)
            .field("shutdown_drain_timeout", &self.shutdown_drain_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("allowed_origins", &self.allowed_origins)
            .field("min_user_agent_length", &self.min_user_agent_length)
            .field("tls_enabled", &self.tls_enabled)
            .field(
                "request_handler",
                &self.request_handler.as_ref().map(|_| "<handler>"),
            )
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 0,
            host: "0.0.0.0".to_owned(),
            heartbeat_interval: Duration::from_millis(30_000),
            min_heartbeat_interval: Duration::from_secs(1),
            max_heartbeat_interval: Duration::from_secs(10),
            adaptive_heartbeat_enabled: true,
            connection_quality_threshold: 0.7,
            latency_window_size: 10,
            session_timeout: Duration::from_millis(300_000),
            max_connections: 1000,
            buffer_size: 4096,
            replay_capacity: 256,
            load_balancer_timeout: Duration::from_millis(60_000),
            max_idle_time: Duration::from_millis(55_000),
            tcp_keepalive_enabled: true,
            max_queue_frames: 1024,
            max_queue_bytes: 4 * 1024 * 1024,
            rate_limit_per_second: 100,
            shutdown_drain_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            allowed_origins: Vec::new(),
            min_user_agent_length: 0,
            tls_enabled: false,
            request_handler: None,
        }
    }
}

impl ServerConfig {
    /// Validate the ordering constraint `pingInterval < maxIdleTime <
    /// loadBalancerTimeout`. A violation is corrected to the default
    /// relationship and logged, never rejected — configuration errors must
    /// not prevent a degraded-but-running server.
    pub fn validated(mut self) -> Self {
        if !(self.heartbeat_interval < self.max_idle_time
            && self.max_idle_time < self.load_balancer_timeout)
        {
            warn!(
                ping_interval_ms = self.heartbeat_interval.as_millis() as u64,
                max_idle_time_ms = self.max_idle_time.as_millis() as u64,
                load_balancer_timeout_ms = self.load_balancer_timeout.as_millis() as u64,
                "keep-alive timing constraint pingInterval < maxIdleTime < loadBalancerTimeout \
                 violated; falling back to corrected defaults"
            );
            let defaults = ServerConfig::default();
            self.heartbeat_interval = defaults.heartbeat_interval;
            self.max_idle_time = defaults.max_idle_time;
            self.load_balancer_timeout = defaults.load_balancer_timeout;
        }
        if self.min_heartbeat_interval > self.max_heartbeat_interval {
            warn!(
                "min_heartbeat_interval > max_heartbeat_interval; swapping to restore ordering"
            );
            std::mem::swap(&mut self.min_heartbeat_interval, &mut self.max_heartbeat_interval);
        }
        self
    }
}
