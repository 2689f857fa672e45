//! HTTP surface: the WebSocket upgrade route and a `/health` JSON endpoint,
//! both sharing a single listener and port with any configured fallback
//! handler.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::events::EventHub;
use crate::rate_limit::Validator;
use crate::session::SessionRegistry;
use crate::supervisor::run_connection;
use crate::upgrade::{check_headers, ConnectionBudget};
use crate::config::ServerConfig;

/// Shared application state handed to every request handler.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub validator: Arc<Validator>,
    pub events: EventHub,
    pub budget: Arc<ConnectionBudget>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    active_sessions: usize,
    active_connections: u32,
    max_connections: u32,
    uptime_seconds: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = HealthBody {
        status: "ok",
        active_sessions: state.registry.len().await,
        active_connections: state.budget.current(),
        max_connections: state.config.max_connections,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };
    Json(body)
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if let Err(rejection) = check_headers(&state.config, &headers) {
        tracing::warn!(%addr, error = %rejection, "rejected upgrade request");
        return (StatusCode::FORBIDDEN, rejection.to_string()).into_response();
    }

    let guard = match state.budget.try_reserve() {
        Ok(guard) => guard,
        Err(rejection) => {
            tracing::warn!(%addr, "rejected upgrade: {rejection}");
            return (StatusCode::SERVICE_UNAVAILABLE, rejection.to_string()).into_response();
        }
    };

    let registry = state.registry.clone();
    let validator = state.validator.clone();
    let events = state.events.clone();
    let shutdown = state.shutdown.clone();
    let client_id = addr.to_string();

    ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        run_connection(socket, client_id, state.config.clone(), registry, validator, events, shutdown).await;
    })
}

/// Dispatches to the configured [`crate::config::RequestHandler`] if one is
/// set, otherwise answers with a plain 404. This is the only way a
/// `requestHandler` hook ever sees a request — it never runs for `/ws` or
/// `/health`, and CORS preflight is answered by its own layer before
/// reaching here.
async fn fallback(State(state): State<Arc<AppState>>, req: Request) -> axum::response::Response {
    match &state.config.request_handler {
        Some(handler) => match handler.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        },
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let tls_enabled = state.config.tls_enabled;

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .fallback(fallback)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'none'"),
        ))
        .layer(TraceLayer::new_for_http());

    if tls_enabled {
        router = router.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        ));
    }

    // CORS goes on last so it's the outermost layer and answers an OPTIONS
    // preflight before the request ever reaches routing or the handler hook.
    router.layer(CorsLayer::permissive()).with_state(state)
}
