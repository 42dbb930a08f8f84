//! Event store client facade.
//!
//! # Purpose
//! Ties the connection pool, the duplex stream driver, and the event
//! consumer together behind `open_stream`, which turns a QUIC bidirectional
//! stream into an ordered, flow-controlled sequence of events.
//!
//! # Failure model
//! A stream that fails stays failed. Reconnecting with a fresh position is
//! left to the caller, who knows the last event it actually processed.
use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use logline_transport::{QuicClient, QuicConnection};
use logline_wire::Message;
use quinn::{RecvStream, SendStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ClientConfig;
use crate::consumer::{ConsumerState, EventConsumer};
use crate::duplex::{DuplexDriver, StreamHandlers};
use crate::error::{ConfigError, StreamError};
use crate::pool::{ConnectionPool, Endpoint, QuicConnector};
use crate::token::{GlobalSequenceToken, TrackingToken, next_offset};
use crate::wire::{FramedSink, FramedSource, read_message, write_message};

/// One event read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEvent {
    pub token: GlobalSequenceToken,
    pub payload: Bytes,
}

/// Network client for a clustered event store.
pub struct EventStoreClient {
    config: ClientConfig,
    nodes: Vec<Endpoint>,
    pool: Arc<ConnectionPool<QuicConnector>>,
}

impl EventStoreClient {
    /// Build the client and its QUIC endpoint. No connection is opened yet;
    /// configuration problems, including an unusable certificate file, are
    /// reported here as [`ConfigError`].
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let nodes = config.server_nodes()?;
        let quinn = config
            .trust_mode()
            .client_config()
            .map_err(ConfigError::from)?;
        let client = QuicClient::bind("0.0.0.0:0".parse()?, quinn, config.transport_config())
            .context("bind event store client endpoint")?;
        debug!(
            nodes = nodes.len(),
            verified = config.trust_mode().is_verified(),
            "event store client ready"
        );
        Ok(Self {
            config,
            nodes,
            pool: Arc::new(ConnectionPool::new(QuicConnector::new(client))),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<QuicConnector>> {
        &self.pool
    }

    /// Connect to the first reachable node. Walks the whole server list each
    /// round and sleeps `connection_retry` between rounds.
    pub async fn connect_any(&self) -> Result<(Endpoint, QuicConnection)> {
        let rounds = self.config.connection_retry_count.max(1);
        let mut last_err = None;
        for round in 1..=rounds {
            for node in &self.nodes {
                match self.pool.get_connection(node).await {
                    Ok(connection) => return Ok((node.clone(), connection)),
                    Err(err) => {
                        tracing::warn!(node = %node, round, error = %err, "event store node unreachable");
                        last_err = Some(err);
                    }
                }
            }
            if round < rounds {
                tokio::time::sleep(self.config.connection_retry).await;
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no event store nodes configured"));
        Err(err.context(format!("no event store node reachable after {rounds} attempts")))
    }

    /// Open an event stream positioned just after `from`, or at the start of
    /// the log when `from` is `None`.
    ///
    /// Unsupported token kinds and invalid permit settings are rejected
    /// before any network traffic.
    pub async fn open_stream(&self, from: Option<&dyn TrackingToken>) -> Result<EventStream> {
        let offset = next_offset(from)?;
        let flow = self.config.flow_control;
        flow.validate()?;

        let (node, connection) = self.connect_any().await?;
        let (mut send, mut recv) = connection.open_bi().await?;
        if let Some(token) = &self.config.token {
            authenticate_stream(
                &mut send,
                &mut recv,
                token,
                self.config.context.as_deref(),
                self.config.max_frame_bytes,
            )
            .await?;
            debug!(node = %node, "event stream authenticated");
        }

        let consumer = Arc::new(EventConsumer::new());
        let handlers: StreamHandlers<Message> = StreamHandlers {
            on_response: {
                let consumer = Arc::clone(&consumer);
                Box::new(move |message: Message| deliver(&consumer, message))
            },
            on_error: {
                let consumer = Arc::clone(&consumer);
                Box::new(move |err: StreamError| {
                    consumer.fail(err);
                })
            },
        };
        let driver = DuplexDriver::start(
            FramedSink { send },
            FramedSource::new(recv, self.config.max_frame_bytes),
            handlers,
            Message::GetEvents {
                tracking_token: Some(offset),
                number_of_permits: flow.initial_permits,
            },
            |permits| Message::GetEvents {
                tracking_token: None,
                number_of_permits: permits,
            },
            flow,
        )?;
        consumer.register_close_listener(move || driver.stop());
        tracing::info!(
            node = %node,
            connection = connection.id(),
            peer = %connection.peer_addr(),
            offset,
            "event stream opened"
        );

        Ok(EventStream { consumer, node })
    }

    /// Drop the pooled connection to `master` after the cluster reported a
    /// topology change. Streams on that connection fail on their own.
    pub fn on_topology_change(&self, master: &Endpoint) -> bool {
        self.pool.shutdown(master)
    }

    /// Close every pooled connection.
    pub fn shutdown(&self) {
        self.pool.cleanup_all();
    }
}

fn deliver(consumer: &EventConsumer<TrackedEvent>, message: Message) -> Result<(), StreamError> {
    match message {
        Message::Event { token, payload } => {
            metrics::counter!("logline_client_events_received_total").increment(1);
            consumer.push(TrackedEvent {
                token: GlobalSequenceToken::new(token),
                payload,
            });
            Ok(())
        }
        Message::Error { message } => Err(StreamError::Remote { message }),
        other => Err(StreamError::transport(anyhow!(
            "unexpected {} message on event stream",
            other.kind()
        ))),
    }
}

async fn authenticate_stream(
    send: &mut SendStream,
    recv: &mut RecvStream,
    token: &str,
    context: Option<&str>,
    max_frame_bytes: usize,
) -> Result<()> {
    write_message(
        send,
        Message::Auth {
            token: token.to_string(),
            context: context.map(str::to_string),
        },
    )
    .await
    .context("send auth")?;
    let mut scratch = BytesMut::with_capacity(1024);
    match read_message(recv, &mut scratch, max_frame_bytes).await? {
        Some(Message::Ok) => Ok(()),
        Some(Message::Error { message }) => Err(anyhow!("auth rejected: {message}")),
        Some(other) => Err(anyhow!("unexpected auth response: {}", other.kind())),
        None => Err(anyhow!("auth response missing")),
    }
}

/// Application handle for one open event stream. Dropping it closes the
/// stream.
#[derive(Debug)]
pub struct EventStream {
    consumer: Arc<EventConsumer<TrackedEvent>>,
    node: Endpoint,
}

impl EventStream {
    /// Wait for the next event. `Ok(None)` after [`close`](Self::close).
    pub async fn next_event(&self) -> Result<Option<TrackedEvent>, StreamError> {
        self.consumer.next_event().await
    }

    pub fn try_next(&self) -> Option<Result<Option<TrackedEvent>, StreamError>> {
        self.consumer.try_next()
    }

    pub fn peek(&self) -> Result<Option<TrackedEvent>, StreamError> {
        self.consumer.peek()
    }

    pub async fn has_next_available(&self, timeout: Duration) -> Result<bool, StreamError> {
        self.consumer.has_next_available(timeout).await
    }

    pub fn close(&self) {
        if self.consumer.close() {
            debug!(node = %self.node, "event stream closed");
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.consumer.state()
    }

    pub fn node(&self) -> &Endpoint {
        &self.node
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}
