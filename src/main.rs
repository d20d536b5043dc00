//! http-relay - Entry Point
//!
//! Builds the strategy chain from the environment and runs the relay server
//! with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use http_relay::config::{Config, LogConfig};
use http_relay::proxy::{ForwardStrategy, HttpRelayProxy, RelayServer, StrategyChain, UpstreamConnector};

#[tokio::main]
async fn main() -> http_relay::Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);
    info!("Starting http-relay");

    let connector = UpstreamConnector::new(
        config.relay.connect_timeout,
        config.relay.read_timeout,
        config.relay.tls_verify,
    )?;

    let strategies: Vec<Arc<dyn ForwardStrategy>> = config
        .upstreams
        .iter()
        .map(|upstream| {
            Arc::new(HttpRelayProxy::new(
                upstream,
                connector.clone(),
                config.relay.http_request_mark,
            )) as Arc<dyn ForwardStrategy>
        })
        .collect();

    if strategies.is_empty() {
        warn!("No upstreams configured, every request will be answered with an error");
    }
    for strategy in &strategies {
        info!("Upstream: {}", strategy.public_name());
    }

    let chain = Arc::new(StrategyChain::new(strategies));
    let server = RelayServer::new(config.server.clone(), chain, config.relay.read_timeout);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Relay server error: {}", e);
        }
    });

    info!("Relay started on {}", config.listen_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    info!("http-relay stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("http_relay={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
