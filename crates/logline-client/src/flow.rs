// Credit-based flow control for event streams.
//
// The server only sends as many events as the client has granted permits.
// Permits are granted optimistically: the budget is topped up at the moment
// a refill request is sent, not when the server acknowledges it.
use crate::error::ConfigError;

pub const DEFAULT_INITIAL_PERMITS: u64 = 100_000;
pub const DEFAULT_REFILL_AMOUNT: u64 = 100_000;
pub const DEFAULT_REFILL_THRESHOLD: u64 = 10_000;

/// Permit settings for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub initial_permits: u64,
    pub refill_amount: u64,
    // Refill once outstanding permits drop to this value. Zero means
    // "only when exhausted", which stalls the stream for a round trip.
    pub refill_threshold: u64,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            initial_permits: DEFAULT_INITIAL_PERMITS,
            refill_amount: DEFAULT_REFILL_AMOUNT,
            refill_threshold: DEFAULT_REFILL_THRESHOLD,
        }
    }
}

impl FlowControl {
    pub fn new(initial_permits: u64, refill_amount: u64, refill_threshold: u64) -> Self {
        Self {
            initial_permits,
            refill_amount,
            refill_threshold,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_permits == 0 {
            return Err(ConfigError::ZeroInitialPermits);
        }
        if self.refill_amount == 0 {
            return Err(ConfigError::ZeroRefillAmount);
        }
        Ok(())
    }

    pub fn budget(&self) -> Result<PermitBudget, ConfigError> {
        self.validate()?;
        Ok(PermitBudget {
            outstanding: self.initial_permits,
            threshold: self.refill_threshold,
            refill_amount: self.refill_amount,
        })
    }
}

/// Live permit accounting, owned by the task that reads the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitBudget {
    outstanding: u64,
    threshold: u64,
    refill_amount: u64,
}

impl PermitBudget {
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Account for one delivered message. Returns the number of permits to
    /// request when the budget fell to the threshold; at most one refill per
    /// delivery.
    pub fn on_delivered(&mut self) -> Option<u64> {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding <= self.threshold {
            self.outstanding = self.outstanding.saturating_add(self.refill_amount);
            return Some(self.refill_amount);
        }
        None
    }
}
