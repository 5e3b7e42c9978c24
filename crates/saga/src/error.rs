//! Saga error types.

use common::AggregateId;
use domain::DomainError;
use event_store::EventStoreError;
use thiserror::Error;

use crate::state::SagaState;

/// Errors raised by the saga manager.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The instance's state machine does not allow the transition.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    #[error("Step {found} is out of order, expected step {expected}")]
    OutOfOrderStep { expected: usize, found: usize },

    #[error("Compensation of step {found} is out of order, expected {expected:?}")]
    OutOfOrderCompensation {
        expected: Option<usize>,
        found: usize,
    },

    /// A compensation kept failing. The saga is parked in `Failed` and needs
    /// an operator.
    #[error("Compensation '{step}' of saga {saga_id} failed: {reason}")]
    CompensationFailed {
        saga_id: AggregateId,
        step: String,
        reason: String,
    },

    /// A stored instance refers to a step its definition no longer has.
    /// The saga is parked.
    #[error("Saga {saga_id} refers to step {index}, which is not defined")]
    StepNotDefined { saga_id: AggregateId, index: usize },

    #[error("Saga '{0}' is registered twice")]
    DuplicateSaga(&'static str),

    /// No definition is registered under this name.
    #[error("Unknown saga type: {0}")]
    UnknownSaga(String),

    #[error("Saga manager has no command bus connected")]
    NotConnected,

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of one forward step or compensation.
#[derive(Debug, Error)]
pub enum StepError {
    /// May succeed on another attempt.
    #[error("{0}")]
    Failed(String),

    /// Another attempt cannot help.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Step data error: {0}")]
    Data(#[from] serde_json::Error),
}

impl StepError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Failed(_) => true,
            Self::Domain(error) => error.is_retriable(),
            Self::Rejected(_) | Self::Data(_) => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
