//! SigmaSockets server binary: reads configuration from the environment and
//! runs until an operator-initiated shutdown.

use sigmasockets::ServerConfig;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        port: env_or("SIGMASOCKETS_PORT", 7878),
        host: std::env::var("SIGMASOCKETS_HOST").unwrap_or(defaults.host),
        max_connections: env_or("SIGMASOCKETS_MAX_CONNECTIONS", defaults.max_connections),
        ..defaults
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config_from_env();
    let server = sigmasockets::SigmaServer::new(config);

    let serve = server.serve();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result?;
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
            server.shutdown();
            tokio::time::timeout(Duration::from_secs(5), serve).await.ok();
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
