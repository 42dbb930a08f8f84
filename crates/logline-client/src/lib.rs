// Streaming client for a clustered, append-only event store.
//
// Every open stream is one QUIC bidirectional stream driven by two tasks:
// a writer that owns the `SendStream` (initial request, permit refills,
// half-close) and a reader that owns the `RecvStream`. Events flow from the
// reader into an `EventConsumer` that application code pulls from.
//
// Backpressure is the server's job. The client grants permits up front and
// refills them as events are delivered, so the local queue never grows past
// what was granted and the reader never blocks on the application.
pub mod config;
pub mod consumer;
pub mod duplex;
pub mod error;
pub mod flow;
pub mod pool;
pub mod store;
pub mod token;
mod wire;

pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_PORT};
pub use consumer::{ConsumerState, EventConsumer};
pub use duplex::{DuplexDriver, RequestSink, ResponseSource, StreamHandlers};
pub use error::{ConfigError, StreamError};
pub use flow::{FlowControl, PermitBudget};
pub use pool::{ConnectionPool, Connector, Endpoint, PooledConnection, QuicConnector};
pub use store::{EventStoreClient, EventStream, TrackedEvent};
pub use token::{GlobalSequenceToken, TrackingToken, next_offset};
