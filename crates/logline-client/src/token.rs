// Tracking tokens: positions in the remote append-only log.
use std::any::Any;
use std::fmt;

use crate::error::ConfigError;

/// A position in some event log. Frameworks may carry their own token kinds;
/// the event store only understands [`GlobalSequenceToken`].
pub trait TrackingToken: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

/// Global index into the store's log. Index `n` means event `n` has been
/// consumed, so a stream resuming from it starts at `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalSequenceToken(u64);

impl GlobalSequenceToken {
    pub fn new(global_index: u64) -> Self {
        Self(global_index)
    }

    pub fn global_index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalSequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TrackingToken for GlobalSequenceToken {
    fn kind(&self) -> &'static str {
        "global_sequence"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// First log offset to request for a stream resuming after `token`.
/// `None` starts from the beginning of the log.
pub fn next_offset(token: Option<&dyn TrackingToken>) -> Result<u64, ConfigError> {
    let Some(token) = token else {
        return Ok(0);
    };
    match token.as_any().downcast_ref::<GlobalSequenceToken>() {
        Some(global) => Ok(global.global_index().saturating_add(1)),
        None => Err(ConfigError::UnsupportedTrackingToken { kind: token.kind() }),
    }
}
