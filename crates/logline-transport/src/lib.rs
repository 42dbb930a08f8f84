// Thin quinn wrappers shared by the event store client and its test store.
//
// Both sides build their endpoint from a `TransportConfig`, which owns the
// stream limits and liveness settings. Everything above this crate speaks in
// `QuicConnection`s and raw bidirectional stream halves.
use anyhow::{Context, Result, anyhow};
use quinn::{Connection, Endpoint, IdleTimeout, RecvStream, SendStream, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod tls;

pub use tls::{TlsError, TrustMode};

/// Application close code used when either side tears a connection down.
pub const CLOSE_CODE_SHUTDOWN: u32 = 0;

/// Stream limits and liveness settings applied to every connection of an
/// endpoint.
///
/// ```
/// use logline_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_streams > 0);
/// assert!(config.keep_alive_interval.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Concurrent bidirectional streams the peer may open.
    pub max_streams: u16,
    /// Interval of QUIC PING frames on an otherwise silent connection.
    pub keep_alive_interval: Option<Duration>,
    /// Silence after which the connection is dropped. `None` defers to the
    /// peer's limit.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            keep_alive_interval: None,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TransportConfig {
    fn to_quinn(&self) -> Result<Arc<quinn::TransportConfig>> {
        let mut quinn = quinn::TransportConfig::default();
        quinn
            .max_concurrent_bidi_streams(VarInt::from(self.max_streams))
            .max_concurrent_uni_streams(VarInt::from_u32(0))
            .keep_alive_interval(self.keep_alive_interval);
        let idle = self
            .idle_timeout
            .map(IdleTimeout::try_from)
            .transpose()
            .context("idle timeout out of range")?;
        quinn.max_idle_timeout(idle);
        Ok(Arc::new(quinn))
    }
}

/// Listening endpoint. Only the integration tests run one.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut tls: quinn::ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        tls.transport_config(transport.to_quinn()?);
        let endpoint = Endpoint::server(tls, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC server endpoint closed"))?;
        let connection = incoming.await.context("complete QUIC handshake")?;
        Ok(QuicConnection::from(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("server local address")
    }

    pub fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"server shutdown");
    }
}

/// Outbound endpoint. One UDP socket carries the connections to every node.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut tls: quinn::ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        tls.transport_config(transport.to_quinn()?);
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(tls);
        Ok(Self { endpoint })
    }

    /// Address family of the bound socket; only peers of the same family are
    /// reachable.
    pub fn is_ipv4(&self) -> bool {
        self.endpoint
            .local_addr()
            .map(|addr| addr.is_ipv4())
            .unwrap_or(true)
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .with_context(|| format!("start handshake with {addr}"))?
            .await
            .with_context(|| format!("complete handshake with {addr}"))?;
        Ok(QuicConnection::from(connection))
    }
}

/// A live connection. Clones share the underlying quinn connection.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
}

impl From<Connection> for QuicConnection {
    fn from(inner: Connection) -> Self {
        Self { inner }
    }
}

impl QuicConnection {
    /// Identifier that stays fixed for the connection's lifetime; used as a
    /// tracing field.
    pub fn id(&self) -> u64 {
        self.inner.stable_id() as u64
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open event stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept event stream")
    }

    /// True once the connection is closing or closed, whoever closed it.
    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    /// Close immediately; open streams observe a connection error.
    pub fn close(&self, reason: &str) {
        self.inner
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), reason.as_bytes());
    }

    pub async fn closed(&self) {
        let _ = self.inner.closed().await;
    }
}
