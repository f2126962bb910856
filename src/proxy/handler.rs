//! Tunnel gateway request handler
//!
//! Takes one inbound proxy request from authentication through to a raw relay
//! against the selected upstream. There are no retries: any failure before the
//! relay answers the client and closes the connection.

use std::sync::Arc;
use std::time::Duration;

use http::header::PROXY_AUTHORIZATION;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::error::{GatewayError, Result};
use crate::models::Upstream;
use crate::proxy::conn::{ClientTransport, Hijacked, RequestHead};
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::rotation::ProxySelector;
use crate::proxy::tunnel::{Tunnel, TunnelStats};

/// Configuration for the tunnel gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Timeout for dialing an upstream proxy
    pub connect_timeout: Duration,
    /// Timeout for writing the forwarded request head
    pub write_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Proxy request handler
pub struct TunnelGateway {
    selector: Arc<dyn ProxySelector>,
    auth: ProxyAuth,
    config: GatewayConfig,
}

impl TunnelGateway {
    pub fn new(selector: Arc<dyn ProxySelector>, auth: ProxyAuth, config: GatewayConfig) -> Self {
        Self {
            selector,
            auth,
            config,
        }
    }

    /// Handle an incoming proxy request
    ///
    /// On success the client has been hijacked and relayed until one side
    /// closed. Errors before the hijack have already been answered to the
    /// client; either way both connections are closed when this returns.
    #[instrument(skip(self, req, client), fields(method = %req.method, target = %req.target))]
    pub async fn handle<C>(&self, mut req: RequestHead, client: C) -> Result<TunnelStats>
    where
        C: ClientTransport,
    {
        if let Err(e) = self.auth.validate(&req) {
            return Self::fail(client, e).await;
        }

        // The gateway's own credential never reaches the upstream.
        req.remove_header(PROXY_AUTHORIZATION.as_str());

        let upstream = match self.selector.select() {
            Ok(upstream) => upstream,
            Err(e) => return Self::fail(client, e).await,
        };

        match upstream.auth_header() {
            Ok(value) => req.append_header(PROXY_AUTHORIZATION.as_str(), value),
            Err(_) => debug!("Upstream {} has no credentials, forwarding without", upstream),
        }

        info!(
            "Got {} request to {}, forwarding to {}",
            req.method, req.target, upstream
        );

        let upstream_conn = match self.dial(&upstream).await {
            Ok(stream) => stream,
            Err(e) => return Self::fail(client, e).await,
        };

        self.tunnel(&req, &upstream, upstream_conn, client).await
    }

    /// Forward the head over an open upstream connection, take over the
    /// client and relay until either side closes
    async fn tunnel<C, S>(
        &self,
        req: &RequestHead,
        upstream: &Upstream,
        mut upstream_conn: S,
        client: C,
    ) -> Result<TunnelStats>
    where
        C: ClientTransport,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = self.forward(req, &mut upstream_conn).await {
            drop(upstream_conn);
            return Self::fail(client, e).await;
        }

        let Hijacked { io, buffered } = match client.hijack() {
            Ok(hijacked) => hijacked,
            Err(client) => {
                drop(upstream_conn);
                return Self::fail(client, GatewayError::HijackUnsupported).await;
            }
        };

        let stats = Tunnel::new(io, upstream_conn).relay(buffered).await?;

        info!(
            upstream = %upstream,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "Tunnel finished"
        );

        Ok(stats)
    }

    /// Open a TCP connection to the upstream proxy
    async fn dial(&self, upstream: &Upstream) -> Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&upstream.address),
        )
        .await
        .map_err(|_| GatewayError::DialFailure {
            address: upstream.address.clone(),
            reason: format!("timed out after {:?}", self.config.connect_timeout),
        })?
        .map_err(|e| GatewayError::DialFailure {
            address: upstream.address.clone(),
            reason: e.to_string(),
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on upstream {}: {}", upstream, e);
        }
        Ok(stream)
    }

    /// Write the rewritten request head to the upstream
    async fn forward<W>(&self, req: &RequestHead, upstream_conn: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.config.write_timeout, req.write_proxy(upstream_conn))
            .await
            .map_err(|_| GatewayError::ForwardFailure("write timed out".into()))?
            .map_err(|e| GatewayError::ForwardFailure(e.to_string()))
    }

    /// Answer the client with the error's status and close it
    async fn fail<C, T>(client: C, err: GatewayError) -> Result<T>
    where
        C: ClientTransport,
    {
        if err.is_server_error() {
            warn!("Request failed: {}", err);
        } else {
            info!("Request rejected: {}", err);
        }
        if let Err(write_err) = client.respond(err.status_code()).await {
            debug!("Failed to write error response: {}", write_err);
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::conn::InboundConn;
    use crate::proxy::rotation::RoundRobinPool;
    use async_trait::async_trait;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn gateway(upstreams: Vec<Upstream>, auth: ProxyAuth) -> TunnelGateway {
        let pool: RoundRobinPool = upstreams.into_iter().collect();
        TunnelGateway::new(Arc::new(pool), auth, GatewayConfig::default())
    }

    fn request(auth: Option<&str>) -> RequestHead {
        let mut req = RequestHead::new(Method::GET, "http://example.com/index.html");
        req.append_header("Host", "example.com");
        if let Some(value) = auth {
            req.append_header("Proxy-Authorization", value);
        }
        req
    }

    /// Client connection backed by an in-memory pipe
    fn client() -> (InboundConn<DuplexStream>, DuplexStream) {
        let (server_side, peer) = tokio::io::duplex(4096);
        (InboundConn::new(server_side, TIMEOUT), peer)
    }

    /// Listener standing in for an upstream proxy; counts accepted connections
    async fn fake_upstream() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn read_head(stream: &mut TcpStream) -> RequestHead {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upstream connection closed before head");
            buf.extend_from_slice(&chunk[..n]);
            if let Some((head, _)) = RequestHead::parse(&buf).unwrap() {
                return head;
            }
        }
    }

    async fn read_all(peer: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(TIMEOUT, peer.read_to_end(&mut out))
            .await
            .expect("client connection was not closed")
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    /// Transport that refuses to be hijacked
    struct NoHijack {
        inner: InboundConn<DuplexStream>,
        responses: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientTransport for NoHijack {
        type Io = DuplexStream;

        async fn respond(self, status: StatusCode) -> Result<()> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            self.inner.respond(status).await
        }

        fn hijack(self) -> std::result::Result<Hijacked<DuplexStream>, Self> {
            Err(self)
        }
    }

    #[tokio::test]
    async fn test_unauthorized_gets_403_without_dial() {
        let (listener, addr) = fake_upstream().await;
        let gw = gateway(vec![Upstream::new(addr)], ProxyAuth::new("user", "pw1"));

        for auth in [None, Some("Basic d3Jvbmc6d3Jvbmc=")] {
            let (conn, mut peer) = client();
            let result = gw.handle(request(auth), conn).await;
            assert!(matches!(result, Err(GatewayError::Unauthorized)));

            let response = read_all(&mut peer).await;
            assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
        }

        // No upstream connection was attempted
        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_empty_pool_gets_500() {
        let gw = gateway(vec![], ProxyAuth::disabled());
        let (conn, mut peer) = client();

        let result = gw.handle(request(None), conn).await;
        assert!(matches!(result, Err(GatewayError::PoolEmpty)));

        let response = read_all(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn test_dial_failure_gets_500_and_closes() {
        // Grab a free port, then release it so the dial is refused
        let (listener, addr) = fake_upstream().await;
        drop(listener);

        let gw = gateway(vec![Upstream::new(addr)], ProxyAuth::disabled());
        let (conn, mut peer) = client();

        let result = gw.handle(request(None), conn).await;
        assert!(matches!(result, Err(GatewayError::DialFailure { .. })));

        let response = read_all(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_hijack_unsupported_gets_500_and_closes_upstream() {
        let (listener, addr) = fake_upstream().await;
        let gw = gateway(vec![Upstream::new(addr)], ProxyAuth::disabled());

        let (inner, mut peer) = client();
        let responses = Arc::new(AtomicUsize::new(0));
        let conn = NoHijack {
            inner,
            responses: responses.clone(),
        };

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            head
        });

        let result = gw.handle(request(None), conn).await;
        assert!(matches!(result, Err(GatewayError::HijackUnsupported)));
        assert_eq!(responses.load(Ordering::SeqCst), 1);

        let response = read_all(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

        // Upstream received the request and then saw its connection closed
        let head = tokio::time::timeout(TIMEOUT, upstream_task)
            .await
            .expect("upstream connection leaked")
            .unwrap();
        assert_eq!(head.target, "http://example.com/index.html");
    }

    #[tokio::test]
    async fn test_rewrites_auth_and_relays() {
        let (listener, addr) = fake_upstream().await;
        let gw = gateway(
            vec![Upstream::with_auth(addr, "u2", "p2")],
            ProxyAuth::new("user", "pw1"),
        );
        let (conn, mut peer) = client();

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            head
        });

        let result = gw.handle(request(Some("Basic dXNlcjpwdzE=")), conn).await;
        let stats = result.unwrap();
        assert_eq!(stats.closed_by, crate::proxy::tunnel::ClosedBy::Upstream);

        let head = upstream_task.await.unwrap();
        assert_eq!(head.header_count("Proxy-Authorization"), 1);
        assert_eq!(head.header("Proxy-Authorization"), Some("Basic dTI6cDI="));
        assert_eq!(head.header("Host"), Some("example.com"));

        let response = read_all(&mut peer).await;
        assert_eq!(response, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    }

    #[tokio::test]
    async fn test_strips_inbound_auth_when_upstream_has_none() {
        let (listener, addr) = fake_upstream().await;
        let gw = gateway(vec![Upstream::new(addr)], ProxyAuth::disabled());
        let (conn, _peer) = client();

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_head(&mut stream).await
        });

        let _ = gw.handle(request(Some("Basic c2VjcmV0OnNlY3JldA==")), conn).await;

        let head = upstream_task.await.unwrap();
        assert_eq!(head.header("Proxy-Authorization"), None);
    }

    #[tokio::test]
    async fn test_forward_failure_gets_500_and_closes() {
        let gw = gateway(vec![], ProxyAuth::disabled());
        let upstream = Upstream::new("10.0.0.1:8080");
        let upstream_conn = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by upstream",
            ))
            .build();
        let (conn, mut peer) = client();

        let result = gw
            .tunnel(&request(None), &upstream, upstream_conn, conn)
            .await;
        assert!(matches!(result, Err(GatewayError::ForwardFailure(_))));

        let response = read_all(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_forward_timeout_gets_500() {
        let pool = RoundRobinPool::new();
        let config = GatewayConfig {
            write_timeout: Duration::from_millis(50),
            ..GatewayConfig::default()
        };
        let gw = TunnelGateway::new(Arc::new(pool), ProxyAuth::disabled(), config);
        let upstream = Upstream::new("10.0.0.1:8080");

        // An upstream that never drains its receive buffer
        let (upstream_conn, _upstream_peer) = tokio::io::duplex(1);
        let (conn, mut peer) = client();

        let result = gw
            .tunnel(&request(None), &upstream, upstream_conn, conn)
            .await;
        assert!(matches!(result, Err(GatewayError::ForwardFailure(_))));

        let response = read_all(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
