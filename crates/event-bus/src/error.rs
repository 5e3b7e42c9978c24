//! Event bus error types.

use thiserror::Error;

/// Errors raised while wiring or driving the bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Two subscribers share a name, so their ledger entries would collide.
    #[error("Duplicate subscriber: {0}")]
    DuplicateSubscriber(String),

    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),
}

/// Failure reported by a subscriber for one event.
///
/// Never propagates to the publisher; the bus logs it, retries it when the
/// error is retriable, and reports it on the delivery handle.
#[derive(Debug, Error)]
pub enum EventHandlerError {
    /// A failure that may succeed on another attempt.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// A failure another attempt cannot fix.
    #[error("Handler rejected event: {0}")]
    Rejected(String),

    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl EventHandlerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
