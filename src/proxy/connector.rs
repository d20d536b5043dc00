//! Upstream connection establishment
//!
//! Opens a timed TCP connection to the relay's upstream proxy and optionally
//! upgrades it to TLS. The byte counter attached to the plain stream is moved
//! onto the TLS stream so accounting survives the upgrade.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};

/// Default bound for the TCP connect and TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound for each read and write on the upstream stream
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Bytes sent to and received from one upstream connection
#[derive(Debug, Default)]
pub struct ByteCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sending(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A live upstream connection, plain or TLS
pub struct UpstreamStream {
    transport: Transport,
    counter: Arc<ByteCounter>,
    io_timeout: Duration,
}

impl UpstreamStream {
    /// Wrap a freshly connected socket with a new byte counter
    pub fn new(stream: TcpStream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            counter: Arc::new(ByteCounter::new()),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn counter(&self) -> Arc<ByteCounter> {
        self.counter.clone()
    }

    pub fn is_secured(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Bound applied by readers and writers of this stream
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn set_io_timeout(&mut self, io_timeout: Duration) {
        self.io_timeout = io_timeout;
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Apply a policy-routing mark (SO_MARK) to outbound packets
    ///
    /// A mark of 0 clears it. Platforms without SO_MARK ignore the call.
    pub fn set_mark(&self, mark: u32) -> std::io::Result<()> {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        {
            socket2::SockRef::from(self.tcp()).set_mark(mark)
        }

        #[cfg(not(any(target_os = "android", target_os = "linux")))]
        {
            let _ = mark;
            Ok(())
        }
    }

    fn tcp(&self) -> &TcpStream {
        match &self.transport {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref().0,
        }
    }

    /// Run a TLS handshake over the plain stream, keeping the byte counter
    async fn secure(self, tls: &TlsConnector, host: &str, handshake_timeout: Duration) -> Result<Self> {
        let UpstreamStream {
            transport,
            counter,
            io_timeout,
        } = self;
        let stream = match transport {
            Transport::Plain(stream) => stream,
            tls @ Transport::Tls(_) => {
                return Ok(Self {
                    transport: tls,
                    counter,
                    io_timeout,
                })
            }
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| RelayError::SecureWrap(format!("invalid server name '{}': {}", host, e)))?;

        let tls_stream = timeout(handshake_timeout, tls.connect(server_name, stream))
            .await
            .map_err(|_| RelayError::SecureWrap("handshake timed out".to_string()))?
            .map_err(|e| RelayError::SecureWrap(e.to_string()))?;

        Ok(Self {
            transport: Transport::Tls(Box::new(tls_stream)),
            counter,
            io_timeout,
        })
    }
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("peer", &self.peer_addr().ok())
            .field("secured", &self.is_secured())
            .field("counter", &self.counter)
            .finish()
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.transport {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Dials the upstream proxy
#[derive(Clone)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
    tls: TlsConnector,
}

impl UpstreamConnector {
    /// Create a connector; `verify_tls` checks upstream certificates against
    /// the webpki root store, otherwise any certificate is accepted
    pub fn new(connect_timeout: Duration, io_timeout: Duration, verify_tls: bool) -> Result<Self> {
        let config = if verify_tls {
            verifying_client_config()?
        } else {
            permissive_client_config()?
        };

        Ok(Self {
            connect_timeout,
            io_timeout,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a connection to `host:port`, upgrading to TLS when `secured`
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16, secured: bool) -> Result<UpstreamStream> {
        let addr = format_tcp_addr(host, port);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                RelayError::Connect(format!(
                    "connect to {} timed out after {:?}",
                    addr, self.connect_timeout
                ))
            })?
            .map_err(|e| RelayError::Connect(format!("connect to {} failed: {}", addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }

        let mut upstream = UpstreamStream::new(stream);
        upstream.set_io_timeout(self.io_timeout);

        if secured {
            upstream = upstream
                .secure(&self.tls, host, self.connect_timeout)
                .await?;
            debug!("TLS session established with {}", addr);
        }

        Ok(upstream)
    }
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

fn verifying_client_config() -> Result<ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| RelayError::InvalidConfig(format!("TLS configuration failed: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(config)
}

fn permissive_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::InvalidConfig(format!("TLS configuration failed: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();

    Ok(config)
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
