//! Inbound HTTP/1.x connection handling
//!
//! Reads a single proxy-style request head off a raw stream and hands the
//! stream back out on hijack. Keep-alive is not supported: every inbound
//! connection carries exactly one request.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 64;

/// Maximum size of the request line plus headers
const MAX_HEAD_BYTES: usize = 32 * 1024;

const READ_CHUNK: usize = 4096;

/// Parsed request line and headers
///
/// Headers are kept in arrival order with their original spelling so the head
/// can be re-serialised for the upstream untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as received (absolute-form or authority-form)
    pub target: String,
    pub version: Version,
    headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Create an HTTP/1.1 request head without headers
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: Vec::new(),
        }
    }

    /// Try to parse a request head from the start of `buf`
    ///
    /// Returns the head and the number of bytes it occupied, or `None` if more
    /// data is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(GatewayError::MalformedRequest(e.to_string())),
        };

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| GatewayError::MalformedRequest("invalid method".into()))?;

        let target = req
            .path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::MalformedRequest("missing request target".into()))?
            .to_string();

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let headers = req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect();

        Ok(Some((
            Self {
                method,
                target,
                version,
                headers,
            },
            head_len,
        )))
    }

    /// Get the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Count headers with the given name (case-insensitive)
    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Remove every header with the given name, returning how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Serialise the head in proxy form
    ///
    /// The request target is written exactly as received, since the upstream is
    /// itself a proxy and needs the absolute target.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(format!(" {:?}\r\n", self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Write the head in proxy form to `writer`
    pub async fn write_proxy<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

/// Raw transport handed out by a successful hijack
pub struct Hijacked<Io> {
    pub io: Io,
    /// Bytes already read past the request head (start of the request body)
    pub buffered: Bytes,
}

/// Client side of a proxied request
///
/// Both operations consume the transport: once a response has been written or
/// the connection has been hijacked, nothing else can be written through the
/// HTTP layer.
#[async_trait]
pub trait ClientTransport: Send + Sized + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Write a gateway-generated response and close the connection
    async fn respond(self, status: StatusCode) -> Result<()>;

    /// Take exclusive ownership of the raw transport
    ///
    /// Transports that cannot be taken over hand themselves back so the caller
    /// can still answer the client.
    fn hijack(self) -> std::result::Result<Hijacked<Self::Io>, Self>;
}

/// Inbound connection that has not yet been hijacked
pub struct InboundConn<S> {
    stream: S,
    buffer: BytesMut,
    write_timeout: Duration,
}

impl<S> InboundConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, write_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            write_timeout,
        }
    }

    /// Read the request head, giving up after `read_timeout`
    pub async fn read_head(&mut self, read_timeout: Duration) -> Result<RequestHead> {
        tokio::time::timeout(read_timeout, self.read_head_inner())
            .await
            .map_err(|_| GatewayError::Timeout)?
    }

    async fn read_head_inner(&mut self) -> Result<RequestHead> {
        loop {
            if let Some((head, head_len)) = RequestHead::parse(&self.buffer)? {
                let _ = self.buffer.split_to(head_len);
                debug!(
                    method = %head.method,
                    target = %head.target,
                    buffered = self.buffer.len(),
                    "Parsed request head"
                );
                return Ok(head);
            }

            if self.buffer.len() >= MAX_HEAD_BYTES {
                return Err(GatewayError::MalformedRequest(
                    "request head too large".into(),
                ));
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(GatewayError::MalformedRequest(
                    "connection closed before request head was complete".into(),
                ));
            }
        }
    }
}

#[async_trait]
impl<S> ClientTransport for InboundConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = S;

    async fn respond(mut self, status: StatusCode) -> Result<()> {
        let response = error_response(status);
        let write_timeout = self.write_timeout;
        let write = async {
            self.stream.write_all(&response).await?;
            self.stream.shutdown().await
        };

        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| GatewayError::Timeout)??;

        Ok(())
    }

    fn hijack(self) -> std::result::Result<Hijacked<S>, Self> {
        Ok(Hijacked {
            io: self.stream,
            buffered: self.buffer.freeze(),
        })
    }
}

/// Build a plain-text response that closes the connection
fn error_response(status: StatusCode) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("");
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        reason,
        reason.len(),
        reason
    )
    .into_bytes()
}
