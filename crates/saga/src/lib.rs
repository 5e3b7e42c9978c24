//! Saga manager for workflows that span several aggregates.
//!
//! A [`SagaDefinition`] lists the events that start a saga and its ordered
//! [`SagaStep`]s. The [`SagaManager`] subscribes to those events, keeps one
//! event-sourced [`SagaInstance`] per correlation key, and runs the steps in
//! order. When a step gives up, the completed steps are compensated in
//! reverse order and the saga ends `Failed`. A compensation that keeps
//! failing parks the saga for an operator.

pub mod definition;
pub mod error;
pub mod events;
pub mod fulfillment;
pub mod instance;
pub mod manager;
pub mod state;

pub use definition::{SagaDefinition, SagaStep, StepContext};
pub use error::{SagaError, StepError};
pub use events::{SagaEvent, SagaTrigger};
pub use fulfillment::{
    InMemoryStockReservations, ORDER_FULFILLMENT, StockReservations, order_fulfillment,
};
pub use instance::{SagaInstance, StepOutcome, StepPhase, StepRecord};
pub use manager::{SagaManager, SagaManagerBuilder, SagaPolicy};
pub use state::SagaState;
