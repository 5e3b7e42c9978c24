//! Runtime error types.

use domain::DomainError;
use event_bus::EventBusError;
use event_store::EventStoreError;
use saga::SagaError;
use thiserror::Error;

/// Errors raised while starting or running the platform.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to install tracing subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),

    #[error("Failed to install metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
