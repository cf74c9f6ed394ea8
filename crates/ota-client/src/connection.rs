//! Connection manager.
//!
//! Opens one TCP session (optionally wrapped in TLS) per request cycle. Each
//! connection is bound to a fresh local port taken from a counter that lives
//! in the `0xC000..=0xFFFF` range, so a reconnect right after a dropped
//! session never reuses the previous 4-tuple.
//!
//! TLS runs in one of two trust modes:
//! - **verify**: chain and host name are checked against trust anchors
//!   loaded from the active certificate region
//! - **no-verify**: chain and host name checks are skipped; used while no
//!   anchors are available or the device clock cannot be trusted

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::ConnError;
use crate::trust::TrustAnchors;

/// First port of the ephemeral range.
pub const EPHEMERAL_PORT_BASE: u16 = 0xC000;

/// A bidirectional byte stream to a server.
pub trait Session: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session for T {}

/// Boxed session handed out by a [`Connector`].
pub type BoxedSession = Box<dyn Session>;

/// Opens sessions to update servers.
#[async_trait]
pub trait Connector: Send {
    /// Open a session to `host:port`, wrapped in TLS when `use_tls` is set.
    async fn connect(&mut self, host: &str, port: u16, use_tls: bool)
        -> Result<BoxedSession, ConnError>;

    /// Replace the TLS trust anchors. `None` selects the no-verify mode.
    fn set_trust_anchors(&mut self, _anchors: Option<TrustAnchors>) {}
}

/// Ephemeral local port counter.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    /// Start counting at `seed`, forced into the ephemeral range.
    pub fn seeded(seed: u16) -> Self {
        Self {
            next: seed | EPHEMERAL_PORT_BASE,
        }
    }

    /// Start at a random point of the ephemeral range.
    pub fn from_entropy() -> Self {
        Self::seeded(rand::random())
    }

    /// Hand out the next port, wrapping back to the start of the range.
    pub fn next_port(&mut self) -> u16 {
        let port = self.next;
        self.next = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }
}

/// Timeouts for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// TCP/TLS connector used on real networks.
pub struct ConnectionManager {
    config: ConnectionConfig,
    ports: PortAllocator,
    provider: Arc<CryptoProvider>,
    tls: Arc<ClientConfig>,
    verifying: bool,
}

impl ConnectionManager {
    /// Create a manager in no-verify mode with a randomly seeded port counter.
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnError> {
        Self::with_ports(config, PortAllocator::from_entropy())
    }

    /// Create a manager with an explicit port counter.
    pub fn with_ports(config: ConnectionConfig, ports: PortAllocator) -> Result<Self, ConnError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = no_verify_config(&provider)?;
        Ok(Self {
            config,
            ports,
            provider,
            tls,
            verifying: false,
        })
    }

    /// Whether certificate chains are currently being validated.
    pub fn is_verifying(&self) -> bool {
        self.verifying
    }

    async fn open_tcp(&mut self, host: &str, port: u16) -> Result<tokio::net::TcpStream, ConnError> {
        let local_port = self.ports.next_port();

        let addr = lookup_host((host, port))
            .await
            .map_err(|source| ConnError::Dns {
                host: host.to_string(),
                source: Some(source),
            })?
            .next()
            .ok_or_else(|| ConnError::Dns {
                host: host.to_string(),
                source: None,
            })?;

        let (socket, unspecified) = match addr {
            SocketAddr::V4(_) => (TcpSocket::new_v4(), IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            SocketAddr::V6(_) => (TcpSocket::new_v6(), IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };
        let socket = socket.map_err(|source| ConnError::Socket { local_port, source })?;
        socket
            .bind(SocketAddr::new(unspecified, local_port))
            .map_err(|source| ConnError::Socket { local_port, source })?;

        debug!(%addr, local_port, "Connecting");
        let stream = timeout(self.config.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| ConnError::Timeout)?
            .map_err(|source| ConnError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        use_tls: bool,
    ) -> Result<BoxedSession, ConnError> {
        let stream = self.open_tcp(host, port).await?;
        if !use_tls {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| ConnError::Tls {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let connector = TlsConnector::from(self.tls.clone());
        let tls = timeout(self.config.connect_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| ConnError::Timeout)?
            .map_err(|e| classify_handshake_error(host, e))?;

        debug!(host, verifying = self.verifying, "TLS session established");
        Ok(Box::new(tls))
    }

    fn set_trust_anchors(&mut self, anchors: Option<TrustAnchors>) {
        let rebuilt = match anchors {
            Some(anchors) => verify_config(&self.provider, &anchors).map(|config| (config, true)),
            None => no_verify_config(&self.provider).map(|config| (config, false)),
        };
        match rebuilt {
            Ok((config, verifying)) => {
                if verifying != self.verifying {
                    info!(verifying, "TLS trust mode changed");
                }
                self.tls = config;
                self.verifying = verifying;
            }
            Err(e) => warn!("Keeping previous TLS configuration: {}", e),
        }
    }
}

fn classify_handshake_error(host: &str, error: std::io::Error) -> ConnError {
    let tls_error = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => ConnError::TlsVerify {
            host: host.to_string(),
            reason: format!("{reason:?}"),
        },
        _ => ConnError::Tls {
            host: host.to_string(),
            reason: error.to_string(),
        },
    }
}

fn verify_config(
    provider: &Arc<CryptoProvider>,
    anchors: &TrustAnchors,
) -> Result<Arc<ClientConfig>, ConnError> {
    let mut roots = RootCertStore::empty();
    for der in anchors.certificates() {
        if let Err(e) = roots.add(CertificateDer::from(der.clone())) {
            warn!("Skipping unusable trust anchor: {}", e);
        }
    }
    if roots.is_empty() {
        return Err(ConnError::Tls {
            host: String::new(),
            reason: "no usable trust anchors".to_string(),
        });
    }

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_setup_error)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn no_verify_config(provider: &Arc<CryptoProvider>) -> Result<Arc<ClientConfig>, ConnError> {
    let verifier = SkipChainValidation {
        algorithms: provider.signature_verification_algorithms,
    };
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_setup_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn tls_setup_error(e: rustls::Error) -> ConnError {
    ConnError::Tls {
        host: String::new(),
        reason: e.to_string(),
    }
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipChainValidation {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SkipChainValidation {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_port_counter_stays_in_range() {
        let mut ports = PortAllocator::seeded(0x1234);
        assert_eq!(ports.next_port(), 0xD234);
        assert_eq!(ports.next_port(), 0xD235);
    }

    #[test]
    fn test_port_counter_wraps() {
        let mut ports = PortAllocator::seeded(0xFFFE);
        assert_eq!(ports.next_port(), 0xFFFE);
        assert_eq!(ports.next_port(), 0xFFFF);
        assert_eq!(ports.next_port(), EPHEMERAL_PORT_BASE);
    }

    #[test]
    fn test_random_seed_in_range() {
        for _ in 0..32 {
            assert!(PortAllocator::from_entropy().next_port() >= EPHEMERAL_PORT_BASE);
        }
    }

    #[test]
    fn test_empty_anchor_set_keeps_no_verify() {
        let mut manager = ConnectionManager::new(ConnectionConfig::default()).unwrap();
        manager.set_trust_anchors(Some(TrustAnchors::default()));
        assert!(!manager.is_verifying());
    }

    #[tokio::test]
    async fn test_plain_connection_uses_allocated_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let seed = 0xC000 | (rand::random::<u16>() & 0x3FF0);
        let mut manager =
            ConnectionManager::with_ports(ConnectionConfig::default(), PortAllocator::seeded(seed))
                .unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            (peer.port(), buf)
        });

        let mut session = manager.connect("127.0.0.1", port, false).await.unwrap();
        session.write_all(b"ping").await.unwrap();

        let (peer_port, received) = server.await.unwrap();
        assert_eq!(peer_port, seed);
        assert_eq!(&received, b"ping");
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut manager = ConnectionManager::new(ConnectionConfig::default()).unwrap();
        let result = manager.connect("127.0.0.1", port, false).await;
        assert!(matches!(result, Err(ConnError::Connect { .. })));
    }
}
