//! Relay listener
//!
//! Accepts client connections, parses the proxy request and hands it to the
//! strategy chain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::proxy::chain::StrategyChain;
use crate::proxy::client::ClientConnection;
use crate::proxy::context::ConnectionContext;

/// Local proxy server in front of the strategy chain
pub struct RelayServer {
    config: ServerConfig,
    chain: Arc<StrategyChain>,
    io_timeout: Duration,
}

impl RelayServer {
    pub fn new(config: ServerConfig, chain: Arc<StrategyChain>, io_timeout: Duration) -> Self {
        Self {
            config,
            chain,
            io_timeout,
        }
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Relay server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let chain = self.chain.clone();
                            let io_timeout = self.io_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    chain,
                                    io_timeout,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        chain: Arc<StrategyChain>,
        io_timeout: Duration,
    ) -> Result<()> {
        let mut conn = ClientConnection::new(stream, client_addr.to_string(), io_timeout);

        let protocol = match conn.read_head().await {
            Ok(head) => head.protocol(),
            Err(e) => {
                warn!("[{}] bad request: {}", client_addr, e);
                return conn.respond_error(400, "Bad Request", &e.to_string()).await;
            }
        };

        match chain.forward(&mut conn, protocol).await {
            Ok(_) => Ok(()),
            Err(e) if conn.forward_started() => Err(e),
            Err(e @ RelayError::UnsupportedProtocol(_)) => {
                conn.respond_error(501, "Not Implemented", &e.to_string()).await
            }
            Err(e) => {
                error!("[{}] {}", client_addr, e);
                conn.respond_error(502, "Bad Gateway", &e.to_string()).await
            }
        }
    }
}
