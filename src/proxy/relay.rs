//! HTTP relay forwarding strategy
//!
//! Sends the client's request to a fixed upstream HTTP proxy, relays the
//! first response back when the request body was complete, then hands the
//! upstream connection to the duplex relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::models::{StrategyFlag, StrategyFlags, StrategyStats};
use crate::proxy::connector::{UpstreamConnector, UpstreamStream};
use crate::proxy::context::{ConnectionContext, Penalty};
use crate::proxy::request::RequestBuilder;
use crate::proxy::strategy::{ForwardOutcome, ForwardStrategy};

/// Relays plain HTTP requests through an upstream HTTP proxy
pub struct HttpRelayProxy {
    host: String,
    port: u16,
    priority: i32,
    is_secured: bool,
    died: AtomicBool,
    flags: StrategyFlags,
    stats: Arc<StrategyStats>,
    connector: UpstreamConnector,
    request_builder: RequestBuilder,
    http_request_mark: Option<u32>,
    #[cfg(test)]
    mark_log: std::sync::Mutex<Vec<u32>>,
}

impl HttpRelayProxy {
    /// Create the strategy; an empty host yields a permanently dead strategy
    pub fn new(
        upstream: &UpstreamConfig,
        connector: UpstreamConnector,
        http_request_mark: Option<u32>,
    ) -> Self {
        let mut flags = StrategyFlags::new();
        if upstream.is_public {
            flags.insert(StrategyFlag::Public);
        }

        Self {
            host: upstream.host.clone(),
            port: upstream.port,
            priority: upstream.priority,
            is_secured: upstream.is_secured,
            died: AtomicBool::new(upstream.host.is_empty()),
            flags,
            stats: Arc::new(StrategyStats::new()),
            connector,
            request_builder: RequestBuilder::new(
                upstream.username.as_deref(),
                upstream.password.as_deref(),
            ),
            http_request_mark: http_request_mark.filter(|mark| *mark != 0),
            #[cfg(test)]
            mark_log: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Take the strategy out of rotation for the rest of its lifetime
    pub fn mark_dead(&self) {
        self.died.store(true, Ordering::Relaxed);
    }

    fn penalty(&self) -> Penalty {
        let stats = self.stats.clone();
        Box::new(move || stats.increase_failed_time())
    }

    fn fall_back(&self, ctx: &mut dyn ConnectionContext, reason: String) -> ForwardOutcome {
        ctx.fall_back(reason.clone(), self.penalty());
        ForwardOutcome::FallbackRequested(reason)
    }

    fn set_mark(&self, upstream: &UpstreamStream, mark: u32) -> std::io::Result<()> {
        self.record_mark(mark);
        upstream.set_mark(mark)
    }

    #[cfg(test)]
    fn record_mark(&self, mark: u32) {
        if let Ok(mut log) = self.mark_log.lock() {
            log.push(mark);
        }
    }

    #[cfg(not(test))]
    fn record_mark(&self, _mark: u32) {}

    #[cfg(test)]
    fn marks(&self) -> Vec<u32> {
        self.mark_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn apply_mark(&self, upstream: &UpstreamStream) -> bool {
        let Some(mark) = self.http_request_mark else {
            return false;
        };

        if let Err(e) = self.set_mark(upstream, mark) {
            warn!(mark, error = %e, "Failed to set SO_MARK on upstream socket");
        }
        true
    }

    fn clear_mark(&self, upstream: &UpstreamStream, marked: bool) {
        if !marked {
            return;
        }

        if let Err(e) = self.set_mark(upstream, 0) {
            warn!(error = %e, "Failed to clear SO_MARK on upstream socket");
        }
    }
}

#[async_trait]
impl ForwardStrategy for HttpRelayProxy {
    #[instrument(skip(self, ctx), fields(host = %self.host, port = self.port))]
    async fn do_forward(&self, ctx: &mut dyn ConnectionContext) -> Result<ForwardOutcome> {
        info!("[{}] http relay {}:{}", ctx.peer(), self.host, self.port);
        let begin_at = Instant::now();

        let mut upstream = match self
            .connector
            .connect(&self.host, self.port, self.is_secured)
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(error = %e, "[{}] http-relay upstream socket connect failed", ctx.peer());
                return Ok(self.fall_back(
                    ctx,
                    format!("http-relay upstream socket connect failed: {}", e),
                ));
            }
        };

        let is_payload_complete = ctx.recv_and_parse_request().await;
        let method = ctx.method().to_string();
        let url = ctx.url().to_string();
        let payload = ctx.payload().to_vec();
        let request = self
            .request_builder
            .build(&method, &url, ctx.headers_mut(), &payload);

        let marked = self.apply_mark(&upstream);
        upstream.counter().sending(request.len());

        let io_timeout = upstream.io_timeout();
        let sent = match timeout(io_timeout, upstream.write_all(&request)).await {
            Ok(result) => result.map_err(|e| RelayError::Send(e.to_string())),
            Err(_) => Err(RelayError::Send(format!("timed out after {:?}", io_timeout))),
        };
        if let Err(e) = sent {
            self.clear_mark(&upstream, marked);
            return Ok(self.fall_back(ctx, e.to_string()));
        }

        if is_payload_complete {
            let response = match ctx.receive_upstream_response(&mut upstream).await {
                Ok(response) => response,
                Err(e) => {
                    self.clear_mark(&upstream, marked);
                    let e = match e {
                        RelayError::Receive(_) => e,
                        other => RelayError::Receive(other.to_string()),
                    };
                    return Ok(self.fall_back(ctx, e.to_string()));
                }
            };
            upstream.counter().received(response.len());
            ctx.set_forward_started();
            if let Err(e) = ctx.write_downstream(&response).await {
                self.clear_mark(&upstream, marked);
                return Err(e);
            }
        }

        self.clear_mark(&upstream, marked);
        self.record_latency(begin_at.elapsed());

        if let Err(e) = ctx.forward(upstream).await {
            debug!(error = %e, "[{}] http relay duplex phase ended with error", ctx.peer());
        }
        self.stats.reset_failed_times();

        Ok(ForwardOutcome::Forwarded)
    }

    fn is_protocol_supported(&self, protocol: &str) -> bool {
        protocol == "HTTP"
    }

    fn public_name(&self) -> String {
        format!("HTTP\t{}", self.host)
    }

    fn is_dead(&self) -> bool {
        self.died.load(Ordering::Relaxed)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn flags(&self) -> StrategyFlags {
        self.flags.clone()
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

impl std::fmt::Display for HttpRelayProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HttpRelayProxy[{}:{} {:.2}]",
            self.host,
            self.port,
            self.stats.latency().as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::proxy::context::mock::MockContext;
    use crate::proxy::request::HeaderList;

    fn upstream_config(host: &str, port: u16) -> UpstreamConfig {
        UpstreamConfig {
            host: host.to_string(),
            port,
            username: None,
            password: None,
            priority: 0,
            is_secured: false,
            is_public: false,
        }
    }

    fn test_connector() -> UpstreamConnector {
        UpstreamConnector::new(Duration::from_secs(1), Duration::from_secs(1), false).unwrap()
    }

    /// Fake upstream proxy: captures the request head and answers with `response`
    async fn spawn_upstream(
        response: &'static [u8],
    ) -> (u16, oneshot::Receiver<Vec<u8>>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(request);
            stream.write_all(response).await.unwrap();
        });

        (port, rx, handle)
    }

    /// Fake upstream that accepts and immediately resets the connection
    async fn spawn_resetting_upstream() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            socket2::SockRef::from(&stream)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(stream);
        });

        (port, handle)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_empty_host_is_dead_at_construction() {
        let proxy = HttpRelayProxy::new(&upstream_config("", 8080), test_connector(), None);
        assert!(proxy.is_dead());

        let proxy = HttpRelayProxy::new(&upstream_config("10.0.0.1", 8080), test_connector(), None);
        assert!(!proxy.is_dead());
        proxy.mark_dead();
        assert!(proxy.is_dead());
    }

    #[test]
    fn test_identity_and_protocol_support() {
        let mut config = upstream_config("relay.example", 3128);
        config.is_public = true;
        config.priority = 5;
        let proxy = HttpRelayProxy::new(&config, test_connector(), None);

        assert!(proxy.is_protocol_supported("HTTP"));
        assert!(!proxy.is_protocol_supported("HTTPS"));
        assert!(!proxy.is_protocol_supported("http"));
        assert_eq!(proxy.public_name(), "HTTP\trelay.example");
        assert_eq!(proxy.priority(), 5);
        assert!(proxy.flags().contains(&StrategyFlag::Public));
        assert_eq!(proxy.to_string(), "HttpRelayProxy[relay.example:3128 0.00]");

        proxy.record_latency(Duration::from_millis(1250));
        assert_eq!(proxy.to_string(), "HttpRelayProxy[relay.example:3128 1.25]");
    }

    #[tokio::test]
    async fn test_connect_failure_requests_fallback_with_penalty() {
        let port = closed_port().await;
        let proxy = HttpRelayProxy::new(&upstream_config("127.0.0.1", port), test_connector(), Some(7));
        let mut ctx = MockContext::get("http://example.com/");

        let outcome = proxy.do_forward(&mut ctx).await.unwrap();
        assert!(proxy.marks().is_empty());

        let ForwardOutcome::FallbackRequested(reason) = &outcome else {
            panic!("expected fallback, got {:?}", outcome);
        };
        assert!(reason.contains("connect"));
        assert_eq!(ctx.fallback_count, 1);
        assert_eq!(ctx.parse_calls, 0);
        assert_eq!(proxy.stats().failed_times(), 0);

        ctx.take_fallback().unwrap().apply_penalty();
        assert_eq!(proxy.stats().failed_times(), 1);
    }

    #[tokio::test]
    async fn test_relays_response_and_hands_off() {
        let (port, request_rx, upstream) =
            spawn_upstream(b"HTTP/1.1 200 OK\r\n\r\nBODY").await;

        let mut config = upstream_config("127.0.0.1", port);
        config.username = Some("u".to_string());
        config.password = Some("p".to_string());
        let proxy = HttpRelayProxy::new(&config, test_connector(), Some(7));
        proxy.increase_failed_time();
        proxy.increase_failed_time();

        let mut ctx = MockContext::get("http://example.com/index.html");
        ctx.headers.append("Connection", "keep-alive");

        let outcome = proxy.do_forward(&mut ctx).await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Forwarded);

        let request = String::from_utf8(request_rx.await.unwrap()).unwrap();
        assert_eq!(
            request,
            "GET http://example.com/index.html HTTP/1.1\r\n\
             Host: example.com\r\n\
             Connection: close\r\n\
             Proxy-Authorization: Basic dTpw\r\n\
             \r\n"
        );
        let encoded = request
            .lines()
            .find_map(|line| line.strip_prefix("Proxy-Authorization: Basic "))
            .unwrap();
        assert_eq!(BASE64.decode(encoded).unwrap(), b"u:p");

        assert_eq!(ctx.downstream, b"HTTP/1.1 200 OK\r\n\r\nBODY");
        assert!(ctx.forward_started);
        assert_eq!(ctx.fallback_count, 0);
        assert_eq!(ctx.headers.get("Connection"), Some("close"));

        let forwarded = ctx.forwarded.take().expect("upstream handed to duplex relay");
        let counter = forwarded.counter();
        assert_eq!(counter.sent_bytes(), request.len() as u64);
        assert_eq!(counter.received_bytes(), 23);

        assert_eq!(proxy.stats().failed_times(), 0);
        assert!(proxy.stats().latency() > Duration::ZERO);
        assert_eq!(proxy.marks(), vec![7, 0]);

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_latency_excludes_duplex_phase() {
        let (port, _request_rx, upstream) =
            spawn_upstream(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let proxy = HttpRelayProxy::new(&upstream_config("127.0.0.1", port), test_connector(), None);

        let mut ctx = MockContext::get("http://example.com/");
        ctx.forward_delay = Duration::from_millis(600);

        let started = std::time::Instant::now();
        let outcome = proxy.do_forward(&mut ctx).await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Forwarded);
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(ctx.forwarded.is_some());

        let latency = proxy.stats().latency();
        assert!(latency > Duration::ZERO);
        assert!(latency < Duration::from_millis(600), "latency {:?}", latency);

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_falls_back_without_reset() {
        let (port, upstream) = spawn_resetting_upstream().await;
        let proxy = HttpRelayProxy::new(&upstream_config("127.0.0.1", port), test_connector(), Some(7));
        proxy.increase_failed_time();

        let mut headers = HeaderList::new();
        headers.append("Host", "example.com");
        headers.append("Content-Length", (32 * 1024 * 1024).to_string());
        let mut ctx = MockContext {
            method: "POST".to_string(),
            url: "http://example.com/upload".to_string(),
            headers,
            payload: vec![b'x'; 32 * 1024 * 1024],
            payload_complete: true,
            ..Default::default()
        };

        let outcome = proxy.do_forward(&mut ctx).await.unwrap();

        assert!(matches!(
            outcome,
            ForwardOutcome::FallbackRequested(ref r) if r.starts_with("Send to upstream failed")
        ));
        assert_eq!(ctx.fallback_count, 1);
        assert!(ctx.downstream.is_empty());
        assert!(!ctx.forward_started);
        assert!(ctx.forwarded.is_none());
        assert_eq!(proxy.stats().failed_times(), 1);
        assert_eq!(proxy.stats().latency(), Duration::ZERO);
        assert_eq!(proxy.marks(), vec![7, 0]);

        ctx.take_fallback().unwrap().apply_penalty();
        assert_eq!(proxy.stats().failed_times(), 2);

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_payload_skips_response_wait() {
        let (port, request_rx, upstream) = spawn_upstream(b"HTTP/1.1 100 Continue\r\n\r\n").await;
        let proxy = HttpRelayProxy::new(&upstream_config("127.0.0.1", port), test_connector(), None);

        let mut headers = HeaderList::new();
        headers.append("Host", "example.com");
        headers.append("Content-Length", "10");
        let mut ctx = MockContext {
            method: "POST".to_string(),
            url: "http://example.com/upload".to_string(),
            headers,
            payload: b"12345".to_vec(),
            payload_complete: false,
            ..Default::default()
        };

        let outcome = proxy.do_forward(&mut ctx).await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Forwarded);
        assert!(ctx.downstream.is_empty());
        assert!(!ctx.forward_started);
        assert!(ctx.forwarded.is_some());

        let request = request_rx.await.unwrap();
        assert!(request.starts_with(b"POST http://example.com/upload HTTP/1.1\r\n"));

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_failure_falls_back_without_reset() {
        let (port, _request_rx, upstream) = spawn_upstream(b"").await;
        let proxy = HttpRelayProxy::new(&upstream_config("127.0.0.1", port), test_connector(), Some(7));
        proxy.increase_failed_time();

        let mut ctx = MockContext::get("http://example.com/");
        let outcome = proxy.do_forward(&mut ctx).await.unwrap();

        assert!(matches!(
            outcome,
            ForwardOutcome::FallbackRequested(ref r) if r.starts_with("Receive from upstream failed")
        ));
        assert_eq!(ctx.fallback_count, 1);
        assert!(ctx.downstream.is_empty());
        assert!(!ctx.forward_started);
        assert!(ctx.forwarded.is_none());
        assert_eq!(proxy.stats().failed_times(), 1);
        assert_eq!(proxy.stats().latency(), Duration::ZERO);
        assert_eq!(proxy.marks(), vec![7, 0]);

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let port = closed_port().await;
        let proxy = Arc::new(HttpRelayProxy::new(
            &upstream_config("127.0.0.1", port),
            test_connector(),
            None,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    let mut ctx = MockContext::get("http://example.com/");
                    proxy.do_forward(&mut ctx).await.unwrap();
                    ctx.take_fallback().unwrap().apply_penalty();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(proxy.stats().failed_times(), 8);
    }
}
