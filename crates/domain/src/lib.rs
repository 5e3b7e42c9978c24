//! Domain layer for the event-sourcing core.
//!
//! - [`Aggregate`] roots change only by applying [`DomainEvent`]s and are
//!   loaded and saved through a [`Repository`].
//! - [`CommandBus`] and [`QueryBus`] route each message type to exactly one
//!   handler.
//! - [`order`] is the reference business module.

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;
pub mod query;
mod registry;
pub mod repository;
pub mod retry;

pub use aggregate::{
    Aggregate, AggregateMeta, DomainEvent, SnapshotCapable, crosses_snapshot_boundary,
};
pub use command::{Command, CommandBus, CommandBusBuilder, CommandHandler};
pub use error::DomainError;
pub use order::{Order, OrderError, OrderEvent, OrderState};
pub use query::{Query, QueryBus, QueryBusBuilder, QueryHandler};
pub use repository::{Repository, SaveOutcome};
pub use retry::retry_on_conflict;
