//! Subscriber trait and retry policy.

use std::time::Duration;

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::EventHandlerError;

/// How many times a subscriber gets to handle one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// A subscriber to committed events.
///
/// Handlers must tolerate redelivery: the bus dedupes through its ledger,
/// but a delivery that failed is released and may arrive again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used as the ledger key and in logs.
    fn name(&self) -> &'static str;

    /// Handles a single event.
    async fn handle(&self, event: &EventEnvelope) -> Result<(), EventHandlerError>;

    /// Overrides the bus-wide retry policy for this handler.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_never_drop_below_one() {
        let policy = RetryPolicy::attempts(0, Duration::from_millis(5));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::default(), RetryPolicy::once());
    }
}
