//! Proxxy Gateway - Entry Point
//!
//! Loads configuration, builds the upstream pool and runs the proxy server
//! until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxxy::config::{Config, LogConfig};
use proxxy::error;
use proxxy::proxy::{ProxySelector, ProxyServer};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    init_tracing(&config.log);
    info!("Starting Proxxy gateway");
    log_fd_limit();

    // Build the upstream pool; an empty pool is fatal
    let pool = Arc::new(config.load_pool()?);
    info!(
        "Loaded {} upstream proxies ({})",
        pool.available_count(),
        pool.strategy_name()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(config.proxy.clone(), pool);

    let server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    tokio::select! {
        result = server_task => {
            // The server only returns on its own when binding fails
            match result {
                Ok(Err(e)) => {
                    error!("Proxy server error: {}", e);
                    return Err(e);
                }
                Ok(Ok(())) => {}
                Err(e) => error!("Proxy server task failed: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    info!("Proxxy gateway stopped");
    Ok(())
}

/// Initialise tracing from the log configuration
///
/// `RUST_LOG` wins over `LOG_LEVEL` when set.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxxy={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Log the open file limit; every tunnel holds two descriptors
#[cfg(unix)]
fn log_fd_limit() {
    use nix::sys::resource::{getrlimit, Resource};

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => info!("Open file limit is {}/{}", soft, hard),
        Err(e) => warn!("Failed to read open file limit: {}", e),
    }
}

#[cfg(not(unix))]
fn log_fd_limit() {}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
