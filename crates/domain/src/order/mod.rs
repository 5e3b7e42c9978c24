//! Order aggregate, its commands and query, and related types.

mod aggregate;
mod commands;
mod events;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::{
    AddLine, CancelOrder, ChangeLineQuantity, ConfirmOrder, DeleteOrder, GetOrder, OrderHandler,
    OrderView, PlaceOrder, RemoveLine, SubmitOrder, register,
};
pub use events::{
    LineQuantityChangedData, LineRemovedData, OrderCancelledData, OrderConfirmedData, OrderEvent,
    OrderPlacedData, OrderSubmittedData,
};
pub use state::OrderState;
pub use value_objects::{CustomerId, Money, OrderLine, ProductId};

use thiserror::Error;

/// Business-rule violations raised by [`Order`] command methods.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Customer ID is required")]
    CustomerIdRequired,

    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: OrderState,
        action: &'static str,
    },

    #[error("Line not found: {product_id}")]
    LineNotFound { product_id: ProductId },

    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: i64 },

    #[error("Order has no lines")]
    NoLines,
}
