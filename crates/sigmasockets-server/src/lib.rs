//! SigmaSockets server engine: a real-time WebSocket fan-out library with
//! resumable sessions, adaptive keep-alive, quality telemetry, rate
//! limiting, and a binary frame codec.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod keepalive;
pub mod quality;
pub mod rate_limit;
pub mod session;
pub mod supervisor;
pub mod upgrade;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::ServerConfig;
pub use events::ConnectionEvent;
pub use sigmasockets_protocol::{close_code, error_code, Envelope};

use broadcast::BroadcastRouter;
use events::EventHub;
use http::{build_router, AppState};
use rate_limit::Validator;
use session::SessionRegistry;
use upgrade::ConnectionBudget;

/// Top-level handle to a running SigmaSockets server: owns the session
/// registry, validator, event hub, and the background GC task.
pub struct SigmaServer {
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    broadcaster: BroadcastRouter,
    gc_handle: tokio::task::JoinHandle<()>,
    rate_limit_evict_handle: tokio::task::JoinHandle<()>,
}

impl SigmaServer {
    /// Construct a server from a validated configuration. Does not bind a
    /// socket yet; call [`SigmaServer::serve`] to start accepting
    /// connections.
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config.validated());
        let registry = Arc::new(SessionRegistry::new(config.session_timeout));
        let validator = Arc::new(Validator::new((*config).clone()));
        let events = EventHub::new(1024);
        let budget = Arc::new(ConnectionBudget::new(config.max_connections));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(AppState {
            config: config.clone(),
            registry: registry.clone(),
            validator,
            events: events.clone(),
            budget,
            shutdown: shutdown_rx,
            started_at: Instant::now(),
        });

        let broadcaster = BroadcastRouter::new(registry.clone(), events.clone());

        let gc_registry = registry.clone();
        let gc_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let expired = gc_registry.gc(Instant::now()).await;
                if !expired.is_empty() {
                    info!(count = expired.len(), "session gc swept expired sessions");
                }
            }
        });

        let evict_validator = state.validator.clone();
        let rate_limit_evict_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                evict_validator.evict_stale(Instant::now()).await;
            }
        });

        SigmaServer {
            state,
            shutdown_tx,
            broadcaster,
            gc_handle,
            rate_limit_evict_handle,
        }
    }

    /// A handle for sending to / broadcasting across attached sessions.
    pub fn broadcaster(&self) -> &BroadcastRouter {
        &self.broadcaster
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.state.events.subscribe()
    }

    pub fn session_registry(&self) -> Arc<SessionRegistry> {
        self.state.registry.clone()
    }

    /// Bind and serve until [`SigmaServer::shutdown`] is called, draining
    /// for up to `shutdownDrainTimeout` before returning.
    pub async fn serve(&self) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.state.config.host, self.state.config.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Like [`SigmaServer::serve`] but against an already-bound listener —
    /// lets a caller (or a test) discover the assigned port before traffic
    /// starts, e.g. by binding `127.0.0.1:0` itself.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "sigmasockets server listening");
        let router = build_router(self.state.clone());
        let listener = TunedListener {
            inner: listener,
            keepalive_enabled: self.state.config.tcp_keepalive_enabled,
        };
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown_tx.subscribe()))
        .await
    }

    /// Signal shutdown. Connections are notified over the same `watch`
    /// channel the supervisor loop already selects on, so existing sockets
    /// get a chance to drain rather than being severed mid-write.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for SigmaServer {
    fn drop(&mut self) {
        self.gc_handle.abort();
        self.rate_limit_evict_handle.abort();
    }
}

/// Wraps the bound [`TcpListener`] so every accepted socket gets
/// `TCP_NODELAY` and, when configured, OS-level TCP keepalive probing —
/// neither of which can be set on the listening socket and inherited, since
/// they're per-connection options.
struct TunedListener {
    inner: TcpListener,
    keepalive_enabled: bool,
}

impl axum::serve::Listener for TunedListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    if self.keepalive_enabled {
                        let ka = socket2::TcpKeepalive::new()
                            .with_time(Duration::from_secs(60))
                            .with_interval(Duration::from_secs(10));
                        let _ = socket2::SockRef::from(&stream).set_tcp_keepalive(&ka);
                    }
                    return (stream, addr);
                }
                Err(err) => {
                    warn!(error = %err, "accept failed, retrying");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
