// One pooled connection per event store node.
use anyhow::{Context, Result, anyhow, bail};
use logline_transport::{QuicClient, QuicConnection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Address of one event store node; the pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub trait PooledConnection: Clone + Send + Sync + 'static {
    /// Tracing identifier.
    fn id(&self) -> u64;
    fn is_closed(&self) -> bool;
    fn close(&self, reason: &str);
}

impl PooledConnection for QuicConnection {
    fn id(&self) -> u64 {
        QuicConnection::id(self)
    }

    fn is_closed(&self) -> bool {
        QuicConnection::is_closed(self)
    }

    fn close(&self, reason: &str) {
        QuicConnection::close(self, reason)
    }
}

/// Establishes new connections for the pool.
pub trait Connector: Send + Sync + 'static {
    type Connection: PooledConnection;

    fn connect(&self, endpoint: &Endpoint)
    -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// Connects over QUIC with the trust mode baked into the client endpoint.
#[derive(Debug)]
pub struct QuicConnector {
    client: QuicClient,
}

impl QuicConnector {
    pub fn new(client: QuicClient) -> Self {
        Self { client }
    }
}

impl Connector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<QuicConnection> {
        let addr = resolve(endpoint, self.client.is_ipv4()).await?;
        self.client
            .connect(addr, &endpoint.host)
            .await
            .with_context(|| format!("connect to event store {endpoint}"))
    }
}

/// Pick the first resolved address of the endpoint's socket family.
async fn resolve(endpoint: &Endpoint, ipv4: bool) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .with_context(|| format!("resolve {endpoint}"))?
        .collect();
    if addrs.is_empty() {
        bail!("{endpoint} resolved to no addresses");
    }
    addrs
        .iter()
        .find(|addr| addr.is_ipv4() == ipv4)
        .copied()
        .ok_or_else(|| {
            let (wanted, found) = if ipv4 { ("IPv4", "IPv6") } else { ("IPv6", "IPv4") };
            anyhow!("{endpoint} resolved only to {found} addresses; the client endpoint is {wanted}")
        })
}

type Slot<C> = Arc<OnceCell<C>>;

// A dead connection and an eviction during connect each cost one retry.
const MAX_LOOKUP_ATTEMPTS: usize = 3;

/// Lazily connected, self-healing map from endpoint to connection.
///
/// Concurrent lookups for the same endpoint share one connection attempt.
/// A connection found closed is dropped from the map and replaced on the
/// same lookup, so callers never see a dead connection from the pool.
pub struct ConnectionPool<K: Connector> {
    connector: K,
    slots: Mutex<HashMap<Endpoint, Slot<K::Connection>>>,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_connection(&self, endpoint: &Endpoint) -> Result<K::Connection> {
        for _ in 0..MAX_LOOKUP_ATTEMPTS {
            let slot = self.slot(endpoint);
            let connection = slot
                .get_or_try_init(|| self.establish(endpoint))
                .await?;
            if !self.is_current(endpoint, &slot) {
                // The slot was shut down mid-connect; nothing else can close
                // what it produced.
                tracing::debug!(
                    endpoint = %endpoint,
                    connection = connection.id(),
                    "discarding connection evicted while connecting"
                );
                connection.close("evicted while connecting");
                continue;
            }
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            if self.evict_if_current(endpoint, &slot) {
                tracing::debug!(
                    endpoint = %endpoint,
                    connection = connection.id(),
                    "replacing dead pooled connection"
                );
            }
        }
        Err(anyhow!(
            "connection to {endpoint} kept closing while being established"
        ))
    }

    /// Evict and close the connection for `endpoint`, e.g. after the cluster
    /// moved its master elsewhere. Streams on it fail independently.
    pub fn shutdown(&self, endpoint: &Endpoint) -> bool {
        let Some(slot) = self.slots.lock().remove(endpoint) else {
            return false;
        };
        metrics::counter!("logline_client_connections_evicted_total").increment(1);
        if let Some(connection) = slot.get() {
            tracing::info!(
                endpoint = %endpoint,
                connection = connection.id(),
                "shutting down pooled connection"
            );
            connection.close("shutdown");
        }
        true
    }

    /// Close every pooled connection without waiting for streams to drain.
    pub fn cleanup_all(&self) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (endpoint, slot) in drained {
            if let Some(connection) = slot.get() {
                tracing::debug!(
                    endpoint = %endpoint,
                    connection = connection.id(),
                    "closing pooled connection"
                );
                connection.close("client shutdown");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    fn slot(&self, endpoint: &Endpoint) -> Slot<K::Connection> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(endpoint.clone()).or_default())
    }

    fn is_current(&self, endpoint: &Endpoint, slot: &Slot<K::Connection>) -> bool {
        self.slots
            .lock()
            .get(endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn evict_if_current(&self, endpoint: &Endpoint, slot: &Slot<K::Connection>) -> bool {
        let mut slots = self.slots.lock();
        // Another caller may already have replaced it.
        if let Some(current) = slots.get(endpoint)
            && Arc::ptr_eq(current, slot)
        {
            slots.remove(endpoint);
            metrics::counter!("logline_client_connections_evicted_total").increment(1);
            return true;
        }
        false
    }

    async fn establish(&self, endpoint: &Endpoint) -> Result<K::Connection> {
        tracing::debug!(endpoint = %endpoint, "opening event store connection");
        let connection = self.connector.connect(endpoint).await?;
        tracing::debug!(
            endpoint = %endpoint,
            connection = connection.id(),
            "event store connection established"
        );
        metrics::counter!("logline_client_connections_created_total").increment(1);
        Ok(connection)
    }
}

impl<K: Connector> fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("ConnectionPool")
            .field("endpoints", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
