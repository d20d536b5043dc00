//! Downstream client connection
//!
//! Concrete [`ConnectionContext`] over an accepted client socket: parses the
//! inbound proxy request, tracks the pending fallback, reads upstream
//! responses and runs the duplex relay.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::proxy::connector::UpstreamStream;
use crate::proxy::context::{ConnectionContext, Fallback, Penalty};
use crate::proxy::request::HeaderList;
use crate::proxy::tunnel;

/// Largest request or response head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Body bytes buffered before the rest is left to the duplex relay
pub const MAX_BUFFERED_BODY: usize = 256 * 1024;

const MAX_HEADERS: usize = 100;

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
}

impl RequestHead {
    /// Protocol name strategies are selected by
    pub fn protocol(&self) -> &'static str {
        if self.method.eq_ignore_ascii_case("CONNECT") {
            "HTTPS"
        } else {
            "HTTP"
        }
    }
}

/// Body framing of a message, as far as the relay needs to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    None,
    Fixed(usize),
    Chunked,
    UntilClose,
}

fn request_body_length(headers: &HeaderList) -> Result<BodyLength> {
    if is_chunked(headers) {
        return Ok(BodyLength::Chunked);
    }

    match headers.get("Content-Length") {
        Some(value) => value
            .trim()
            .parse()
            .map(BodyLength::Fixed)
            .map_err(|_| RelayError::InvalidRequest(format!("invalid Content-Length: {}", value))),
        None => Ok(BodyLength::None),
    }
}

fn response_body_length(method: &str, status: u16, headers: &HeaderList) -> BodyLength {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return BodyLength::None;
    }

    if is_chunked(headers) {
        return BodyLength::Chunked;
    }

    match headers
        .get("Content-Length")
        .and_then(|value| value.trim().parse().ok())
    {
        Some(length) => BodyLength::Fixed(length),
        None => BodyLength::UntilClose,
    }
}

fn is_chunked(headers: &HeaderList) -> bool {
    headers
        .get("Transfer-Encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn body_complete(length: BodyLength, body: &[u8]) -> bool {
    match length {
        BodyLength::None => true,
        BodyLength::Fixed(length) => body.len() >= length,
        BodyLength::Chunked => chunked_complete(body),
        BodyLength::UntilClose => false,
    }
}

/// Walk the chunk framing up to the last chunk and the end of its trailers
fn chunked_complete(mut body: &[u8]) -> bool {
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(body) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) | Err(_) => return false,
        };
        body = &body[consumed..];

        if size == 0 {
            return body.starts_with(b"\r\n") || body.windows(4).any(|w| w == b"\r\n\r\n");
        }

        // Chunk data is followed by its own CRLF.
        let framed = match usize::try_from(size).ok().and_then(|s| s.checked_add(2)) {
            Some(framed) => framed,
            None => return false,
        };
        if body.len() < framed {
            return false;
        }
        body = &body[framed..];
    }
}

fn expects_continue(headers: &HeaderList) -> bool {
    headers
        .get("Expect")
        .map(|value| value.trim().eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> HeaderList {
    headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

/// Read one chunk into `buf`, bounded by `io_timeout`; returns bytes read
async fn read_some<R>(reader: &mut R, buf: &mut BytesMut, io_timeout: Duration) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(8 * 1024);
    timeout(io_timeout, reader.read_buf(buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?
}

/// Read and parse a request head; returns the head and any body bytes that
/// arrived with it
pub async fn read_request_head<R>(reader: &mut R, io_timeout: Duration) -> Result<(RequestHead, BytesMut)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();

    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(head_len) = request.parse(&buf)? {
            let head = RequestHead {
                method: request.method.unwrap_or_default().to_string(),
                url: request.path.unwrap_or_default().to_string(),
                headers: collect_headers(request.headers),
            };
            let body = buf.split_off(head_len);
            return Ok((head, body));
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RelayError::InvalidRequest("request head too large".to_string()));
        }

        let n = read_some(reader, &mut buf, io_timeout).await?;
        if n == 0 {
            return Err(RelayError::InvalidRequest(
                "client closed before sending a complete request head".to_string(),
            ));
        }
    }
}

/// Read an upstream response head plus whatever body can be buffered
///
/// Fails with [`RelayError::Receive`] unless a complete response head arrives
/// within the timeout. After the head, reading stops at the end of the body,
/// at EOF, at the buffering limit or on timeout; anything left is carried by
/// the duplex relay.
pub async fn receive_response<R>(reader: &mut R, method: &str, io_timeout: Duration) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();

    let (head_len, length) = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = response.code.unwrap_or_default();
                let headers = collect_headers(response.headers);
                break (head_len, response_body_length(method, status, &headers));
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => {
                return Err(RelayError::Receive(format!("malformed response head: {}", e)));
            }
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RelayError::Receive("response head too large".to_string()));
        }

        match read_some(reader, &mut buf, io_timeout).await {
            Ok(0) if buf.is_empty() => {
                return Err(RelayError::Receive("upstream closed without response".to_string()))
            }
            Ok(0) => {
                return Err(RelayError::Receive(
                    "upstream closed inside response head".to_string(),
                ))
            }
            Ok(_) => {}
            Err(e) => return Err(RelayError::Receive(e.to_string())),
        }
    };

    while !body_complete(length, &buf[head_len..]) && buf.len() - head_len < MAX_BUFFERED_BODY {
        match read_some(reader, &mut buf, io_timeout).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Stopped buffering response body");
                break;
            }
        }
    }

    Ok(buf.freeze())
}

/// A client connection accepted by the relay server
pub struct ClientConnection<S> {
    downstream: S,
    peer: String,
    io_timeout: Duration,
    head: Option<RequestHead>,
    body_length: BodyLength,
    payload: BytesMut,
    forward_started: bool,
    fallback: Option<Fallback>,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(downstream: S, peer: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            downstream,
            peer: peer.into(),
            io_timeout,
            head: None,
            body_length: BodyLength::None,
            payload: BytesMut::new(),
            forward_started: false,
            fallback: None,
        }
    }

    /// Read the request head from the client if not done yet
    pub async fn read_head(&mut self) -> Result<&RequestHead> {
        if self.head.is_none() {
            let (head, payload) = read_request_head(&mut self.downstream, self.io_timeout).await?;
            self.body_length = request_body_length(&head.headers)?;
            self.payload = payload;
            self.head = Some(head);
        }

        self.head
            .as_ref()
            .ok_or_else(|| RelayError::Internal("request head missing after parse".to_string()))
    }

    /// Read the rest of the request body, bounded by the buffering limit
    ///
    /// Stops at EOF or the read timeout. Clients waiting for `100 Continue`
    /// are not waited on.
    async fn read_body_remainder(&mut self) {
        let waits_for_continue = self
            .head
            .as_ref()
            .map(|head| expects_continue(&head.headers))
            .unwrap_or(false);
        if waits_for_continue {
            return;
        }

        while !body_complete(self.body_length, &self.payload) && self.payload.len() < MAX_BUFFERED_BODY {
            match read_some(&mut self.downstream, &mut self.payload, self.io_timeout).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Stopped waiting for request body");
                    break;
                }
            }
        }
    }

    pub fn protocol(&self) -> Option<&'static str> {
        self.head.as_ref().map(RequestHead::protocol)
    }

    /// Answer the client with a minimal error response
    pub async fn respond_error(&mut self, status: u16, reason: &str, message: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            message.len(),
            message
        );
        self.downstream.write_all(response.as_bytes()).await?;
        self.downstream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> ConnectionContext for ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn peer(&self) -> &str {
        &self.peer
    }

    fn method(&self) -> &str {
        self.head.as_ref().map(|head| head.method.as_str()).unwrap_or("")
    }

    fn url(&self) -> &str {
        self.head.as_ref().map(|head| head.url.as_str()).unwrap_or("")
    }

    fn headers(&self) -> &HeaderList {
        static EMPTY: HeaderList = HeaderList::empty();
        self.head.as_ref().map(|head| &head.headers).unwrap_or(&EMPTY)
    }

    fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self
            .head
            .get_or_insert_with(|| RequestHead {
                method: String::new(),
                url: String::new(),
                headers: HeaderList::new(),
            })
            .headers
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn forward_started(&self) -> bool {
        self.forward_started
    }

    fn set_forward_started(&mut self) {
        self.forward_started = true;
    }

    async fn recv_and_parse_request(&mut self) -> bool {
        let parsed = self.read_head().await.map(|_| ());
        if let Err(e) = parsed {
            warn!(peer = %self.peer, error = %e, "Failed to parse client request");
            return false;
        }
        self.read_body_remainder().await;
        body_complete(self.body_length, &self.payload)
    }

    async fn receive_upstream_response(&mut self, upstream: &mut UpstreamStream) -> Result<Bytes> {
        let io_timeout = upstream.io_timeout();
        receive_response(upstream, self.method(), io_timeout).await
    }

    async fn write_downstream(&mut self, data: &[u8]) -> Result<()> {
        self.downstream.write_all(data).await?;
        Ok(())
    }

    fn fall_back(&mut self, reason: String, penalty: Penalty) {
        debug!(peer = %self.peer, reason = %reason, "Strategy requested fallback");
        self.fallback = Some(Fallback::new(reason, penalty));
    }

    fn take_fallback(&mut self) -> Option<Fallback> {
        self.fallback.take()
    }

    async fn forward(&mut self, upstream: UpstreamStream) -> Result<()> {
        self.forward_started = true;
        let (sent, received) = tunnel::relay_upstream(&mut self.downstream, upstream).await?;
        debug!(peer = %self.peer, sent, received, "Client relay finished");
        Ok(())
    }
}
