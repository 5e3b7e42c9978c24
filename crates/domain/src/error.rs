//! Domain error types.

use common::{AggregateId, IsolationError};
use event_store::{EventStoreError, Version};
use thiserror::Error;

use crate::order::OrderError;

/// Errors returned by repositories, buses and use-case handlers.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid isolation context: {0}")]
    InvalidIsolationContext(#[from] IsolationError),

    /// The caller's context does not contain the aggregate's scope.
    #[error("Access denied to {aggregate_type} {aggregate_id}")]
    UnauthorizedAccess {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    #[error("{aggregate_type} not found: {aggregate_id}")]
    NotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// A create found the id already taken. Carries no stored version, so
    /// it says nothing about an aggregate the caller cannot see.
    #[error("{aggregate_type} already exists: {aggregate_id}")]
    AlreadyExists {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// Another writer appended first. Reload and rerun the whole command.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    #[error("A {kind} handler is already registered for {type_name}")]
    DuplicateHandler {
        kind: &'static str,
        type_name: &'static str,
    },

    #[error("No {kind} handler registered for {type_name}")]
    HandlerNotFound {
        kind: &'static str,
        type_name: &'static str,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// The stream skipped or repeated a version while loading.
    #[error("Event stream for {aggregate_id} is corrupted: expected version {expected}, read {found}")]
    StreamCorrupted {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// True only for concurrency conflicts, the one error a caller may
    /// answer by reloading and running the command again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIsolationContext(_) => "invalid_isolation_context",
            Self::UnauthorizedAccess { .. } => "unauthorized_access",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::DuplicateHandler { .. } => "duplicate_handler",
            Self::HandlerNotFound { .. } => "handler_not_found",
            Self::Validation(_) => "validation",
            Self::StreamCorrupted { .. } => "stream_corrupted",
            Self::Order(_) => "order",
            Self::EventStore(_) => "event_store",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<EventStoreError> for DomainError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            },
            other => Self::EventStore(other),
        }
    }
}
