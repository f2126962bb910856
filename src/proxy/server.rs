//! Proxy server accept loop
//!
//! Accepts client connections and runs each one on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::config::ProxyServerConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::conn::{ClientTransport, InboundConn};
use crate::proxy::handler::{GatewayConfig, TunnelGateway};
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::rotation::ProxySelector;

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    gateway: Arc<TunnelGateway>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyServerConfig, selector: Arc<dyn ProxySelector>) -> Self {
        let gateway_config = GatewayConfig {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            write_timeout: Duration::from_secs(config.write_timeout),
        };

        let auth = ProxyAuth::new(&config.auth_username, &config.auth_password);
        if auth.is_enabled() {
            info!("Proxy authentication enabled");
        } else {
            info!("Proxy authentication disabled, gateway is open");
        }

        let gateway = Arc::new(TunnelGateway::new(selector, auth, gateway_config));

        Self { config, gateway }
    }

    /// Bind the listener and run the proxy server
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener until shutdown
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let read_timeout = Duration::from_secs(self.config.read_timeout);
        let write_timeout = Duration::from_secs(self.config.write_timeout);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let gateway = self.gateway.clone();
                            let span = info_span!(
                                "conn",
                                id = %Uuid::new_v4(),
                                client = %client_addr
                            );

                            tokio::spawn(
                                Self::handle_connection(
                                    stream,
                                    client_addr,
                                    gateway,
                                    read_timeout,
                                    write_timeout,
                                )
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
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
        gateway: Arc<TunnelGateway>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", client_addr, e);
        }
        let mut conn = InboundConn::new(stream, write_timeout);

        let req = match conn.read_head(read_timeout).await {
            Ok(req) => req,
            Err(e @ GatewayError::MalformedRequest(_)) => {
                debug!("Bad request from {}: {}", client_addr, e);
                let _ = conn.respond(e.status_code()).await;
                return;
            }
            Err(e) => {
                debug!("Failed to read request from {}: {}", client_addr, e);
                return;
            }
        };

        match gateway.handle(req, conn).await {
            Ok(stats) => debug!(
                bytes_sent = stats.bytes_sent,
                bytes_received = stats.bytes_received,
                "Connection finished"
            ),
            Err(e) if e.is_client_error() => debug!("Connection rejected: {}", e),
            Err(e) => info!(status = %e.status_code(), "Connection closed with error: {}", e),
        }
    }
}
