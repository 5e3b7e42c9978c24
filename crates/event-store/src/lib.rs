//! Event store for the event-sourcing core.
//!
//! - [`EventStore`] appends events under an optimistic-concurrency check and
//!   serves ordered, restartable streams for replay.
//! - [`SnapshotStore`] keeps the latest materialized state per aggregate.
//! - In-memory bindings for tests and single-process use, PostgreSQL bindings
//!   for durable storage.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod snapshot;
pub mod store;

pub use common::{AggregateId, IsolationContext};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventId, EventKey, NewEvent, NewEventBuilder, Version};
pub use memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use postgres::{PostgresEventStore, PostgresSnapshotStore};
pub use query::EventQuery;
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{EventStore, EventStoreExt, EventStream};
