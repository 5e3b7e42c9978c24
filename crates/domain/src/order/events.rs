//! Order domain events.

use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{CustomerId, Money, OrderLine, ProductId};

/// Events recorded by the [`Order`](super::Order) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderPlaced(OrderPlacedData),
    LineAdded(OrderLine),
    LineRemoved(LineRemovedData),
    LineQuantityChanged(LineQuantityChangedData),
    OrderSubmitted(OrderSubmittedData),
    OrderConfirmed(OrderConfirmedData),
    OrderCancelled(OrderCancelledData),
    OrderDeleted,
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "OrderPlaced",
            OrderEvent::LineAdded(_) => "OrderLineAdded",
            OrderEvent::LineRemoved(_) => "OrderLineRemoved",
            OrderEvent::LineQuantityChanged(_) => "OrderLineQuantityChanged",
            OrderEvent::OrderSubmitted(_) => "OrderSubmitted",
            OrderEvent::OrderConfirmed(_) => "OrderConfirmed",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
            OrderEvent::OrderDeleted => "OrderDeleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRemovedData {
    pub product_id: ProductId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineQuantityChangedData {
    pub product_id: ProductId,
    pub old_quantity: u32,
    pub new_quantity: u32,
}

/// Carries the lines so downstream sagas need not load the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmittedData {
    pub customer_id: CustomerId,
    pub lines: Vec<OrderLine>,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmedData {
    pub reservation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub reason: String,
}
