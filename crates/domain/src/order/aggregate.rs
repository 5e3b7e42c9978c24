//! Order aggregate implementation.

use std::collections::BTreeMap;

use common::{AggregateId, IsolationContext};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, AggregateMeta, SnapshotCapable};

use super::events::{
    LineQuantityChangedData, LineRemovedData, OrderCancelledData, OrderConfirmedData,
    OrderPlacedData, OrderSubmittedData,
};
use super::{CustomerId, Money, OrderError, OrderEvent, OrderLine, OrderState, ProductId};

/// Order aggregate root.
///
/// Lines are child records owned by the order and keyed by product id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    meta: AggregateMeta<OrderEvent>,
    customer_id: Option<CustomerId>,
    state: OrderState,
    lines: BTreeMap<ProductId, OrderLine>,
    total: Money,
    reservation_id: Option<String>,
    cancellation_reason: Option<String>,
}

impl Aggregate for Order {
    type Event = OrderEvent;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn meta(&self) -> &AggregateMeta<OrderEvent> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta<OrderEvent> {
        &mut self.meta
    }

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::OrderPlaced(data) => {
                self.customer_id = Some(data.customer_id);
                self.state = OrderState::Draft;
            }
            OrderEvent::LineAdded(line) => {
                self.lines.insert(line.product_id.clone(), line.clone());
                self.recalculate_total();
            }
            OrderEvent::LineRemoved(data) => {
                self.lines.remove(&data.product_id);
                self.recalculate_total();
            }
            OrderEvent::LineQuantityChanged(data) => {
                if let Some(line) = self.lines.get_mut(&data.product_id) {
                    line.quantity = data.new_quantity;
                }
                self.recalculate_total();
            }
            OrderEvent::OrderSubmitted(_) => self.state = OrderState::Submitted,
            OrderEvent::OrderConfirmed(data) => {
                self.state = OrderState::Confirmed;
                self.reservation_id = data.reservation_id.clone();
            }
            OrderEvent::OrderCancelled(data) => {
                self.state = OrderState::Cancelled;
                self.cancellation_reason = Some(data.reason.clone());
            }
            OrderEvent::OrderDeleted => {}
        }
    }

    fn is_deletion(event: &OrderEvent) -> bool {
        matches!(event, OrderEvent::OrderDeleted)
    }
}

impl SnapshotCapable for Order {
    fn snapshot_interval() -> u64 {
        50
    }
}

// Query methods
impl Order {
    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    /// Lines in product-id order.
    pub fn lines(&self) -> impl Iterator<Item = &OrderLine> {
        self.lines.values()
    }

    pub fn line(&self, product_id: &ProductId) -> Option<&OrderLine> {
        self.lines.get(product_id)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn reservation_id(&self) -> Option<&str> {
        self.reservation_id.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }
}

// Command methods
impl Order {
    /// Places a new order in the caller's scope. The order is at version 0
    /// with one pending `OrderPlaced` event.
    pub fn place(id: AggregateId, isolation: IsolationContext, customer_id: CustomerId) -> Self {
        let mut order = Self::blank(id, isolation);
        order.record(OrderEvent::OrderPlaced(OrderPlacedData {
            order_id: id,
            customer_id,
        }));
        order
    }

    /// Adds a line, or raises the quantity of the existing line for the
    /// same product.
    pub fn add_line(&mut self, line: OrderLine) -> Result<(), OrderError> {
        self.ensure(self.state.can_modify_lines(), "add line")?;
        if line.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                quantity: line.quantity,
            });
        }
        if !line.unit_price.is_positive() {
            return Err(OrderError::InvalidPrice {
                price: line.unit_price.cents(),
            });
        }

        let event = match self.lines.get(&line.product_id) {
            Some(existing) => OrderEvent::LineQuantityChanged(LineQuantityChangedData {
                product_id: line.product_id,
                old_quantity: existing.quantity,
                new_quantity: existing.quantity.saturating_add(line.quantity),
            }),
            None => OrderEvent::LineAdded(line),
        };
        self.record(event);
        Ok(())
    }

    pub fn remove_line(&mut self, product_id: ProductId) -> Result<(), OrderError> {
        self.ensure(self.state.can_modify_lines(), "remove line")?;
        if !self.lines.contains_key(&product_id) {
            return Err(OrderError::LineNotFound { product_id });
        }
        self.record(OrderEvent::LineRemoved(LineRemovedData { product_id }));
        Ok(())
    }

    /// Sets a line's quantity. Zero removes the line; the same quantity
    /// records nothing.
    pub fn change_quantity(
        &mut self,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<(), OrderError> {
        self.ensure(self.state.can_modify_lines(), "change quantity")?;
        let Some(existing) = self.lines.get(&product_id) else {
            return Err(OrderError::LineNotFound { product_id });
        };

        if quantity == 0 {
            self.record(OrderEvent::LineRemoved(LineRemovedData { product_id }));
        } else if quantity != existing.quantity {
            let old_quantity = existing.quantity;
            self.record(OrderEvent::LineQuantityChanged(LineQuantityChangedData {
                product_id,
                old_quantity,
                new_quantity: quantity,
            }));
        }
        Ok(())
    }

    pub fn submit(&mut self) -> Result<(), OrderError> {
        self.ensure(self.state.can_submit(), "submit")?;
        if self.lines.is_empty() {
            return Err(OrderError::NoLines);
        }
        let Some(customer_id) = self.customer_id else {
            return Err(OrderError::CustomerIdRequired);
        };

        self.record(OrderEvent::OrderSubmitted(OrderSubmittedData {
            customer_id,
            lines: self.lines.values().cloned().collect(),
            total: self.total,
        }));
        Ok(())
    }

    pub fn confirm(&mut self, reservation_id: Option<String>) -> Result<(), OrderError> {
        self.ensure(self.state.can_confirm(), "confirm")?;
        self.record(OrderEvent::OrderConfirmed(OrderConfirmedData {
            reservation_id,
        }));
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        self.ensure(self.state.can_cancel(), "cancel")?;
        self.record(OrderEvent::OrderCancelled(OrderCancelledData {
            reason: reason.into(),
        }));
        Ok(())
    }

    /// Soft-deletes the order. Its events stay in the store.
    pub fn delete(&mut self) -> Result<(), OrderError> {
        self.ensure(self.state.can_delete(), "delete")?;
        self.record(OrderEvent::OrderDeleted);
        Ok(())
    }

    fn ensure(&self, allowed: bool, action: &'static str) -> Result<(), OrderError> {
        if allowed {
            Ok(())
        } else {
            Err(OrderError::InvalidStateTransition {
                current_state: self.state,
                action,
            })
        }
    }

    fn recalculate_total(&mut self) {
        self.total = self.lines.values().map(OrderLine::total).sum();
    }
}
