// Error shapes surfaced to applications.
use std::sync::Arc;

use logline_transport::TlsError;

/// Usage or configuration problems, reported before any network traffic.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("initial permits must be greater than zero")]
    ZeroInitialPermits,
    #[error("refill amount must be greater than zero")]
    ZeroRefillAmount,
    #[error("unsupported tracking token kind {kind}; expected a global sequence token")]
    UnsupportedTrackingToken { kind: &'static str },
    #[error("invalid server entry {entry:?}: {reason}")]
    InvalidServer { entry: String, reason: String },
    #[error("no event store servers configured")]
    NoServers,
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Failure of a single event stream.
///
/// Cloned to every reader that observes it, so the original cause is kept
/// behind an `Arc` and remains reachable through `source()`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamError {
    #[error("event stream transport failed: {0}")]
    Transport(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
    #[error("event store rejected the stream: {message}")]
    Remote { message: String },
    #[error("event store closed the stream")]
    ClosedByServer,
}

impl StreamError {
    pub fn transport(err: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
        Self::Transport(Arc::from(boxed))
    }
}
