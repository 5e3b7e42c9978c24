//! Shared building blocks for the event-sourcing core.
//!
//! - [`AggregateId`] identifies an aggregate instance.
//! - [`IsolationContext`] scopes every read and write to a level of the
//!   platform → tenant → organization → department → user hierarchy.
//! - [`Clock`] and [`IdGenerator`] are the time and identity ports.

pub mod clock;
pub mod isolation;
pub mod types;

pub use clock::{
    Clock, FixedClock, IdGenerator, RandomIdGenerator, SequentialIdGenerator, SystemClock,
};
pub use isolation::{IsolationContext, IsolationError, IsolationLevel, IsolationResolver};
pub use types::AggregateId;
