//! Event bus for committed events.
//!
//! - [`EventHandler`] is a subscriber, with an optional [`RetryPolicy`].
//! - [`ProcessedEventLedger`] records which `(handler, aggregate id, version)`
//!   deliveries already happened so redelivery has no second side effect.
//! - [`EventBus`] fans a committed batch out to every matching subscriber on
//!   its own task, in order per subscriber.
//! - [`catch_up`] re-publishes the store's log through the bus.

pub mod bus;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod replay;

pub use bus::{DeliveryHandle, DeliveryReport, EventBus, EventBusBuilder, FailedDelivery};
pub use error::{EventBusError, EventHandlerError, Result};
pub use handler::{EventHandler, RetryPolicy};
pub use ledger::{DEFAULT_LEDGER_CAPACITY, InMemoryLedger, ProcessedEventLedger};
pub use replay::{CatchUpReport, catch_up};
