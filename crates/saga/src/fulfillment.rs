//! Order fulfillment: reserve stock for a submitted order and confirm it,
//! or release the stock and cancel the order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use common::AggregateId;
use domain::order::{
    CancelOrder, ConfirmOrder, OrderError, OrderEvent, OrderLine, OrderState, OrderSubmittedData,
    ProductId,
};
use domain::{DomainError, retry_on_conflict};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::definition::{SagaDefinition, SagaStep, StepContext};
use crate::error::StepError;

pub const ORDER_FULFILLMENT: &str = "order-fulfillment";

const COMMAND_ATTEMPTS: u32 = 3;

/// Port to the stock system.
#[async_trait]
pub trait StockReservations: Send + Sync {
    /// Reserves the lines for an order. Reserving again for the same order
    /// returns the existing reservation.
    async fn reserve(&self, order_id: AggregateId, lines: &[OrderLine])
    -> Result<String, StepError>;

    /// Releases a reservation. Unknown ids are ignored.
    async fn release(&self, reservation_id: &str) -> Result<(), StepError>;
}

#[derive(Debug)]
struct Reservation {
    order_id: AggregateId,
    quantities: Vec<(ProductId, u32)>,
}

#[derive(Debug, Default)]
struct StockState {
    available: HashMap<ProductId, u32>,
    reservations: HashMap<String, Reservation>,
    by_order: HashMap<AggregateId, String>,
}

/// In-memory stock levels.
#[derive(Debug, Default)]
pub struct InMemoryStockReservations {
    state: Mutex<StockState>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStockReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(mut self, product_id: impl Into<ProductId>, quantity: u32) -> Self {
        self.state
            .get_mut()
            .available
            .insert(product_id.into(), quantity);
        self
    }

    /// While set, every call fails with a retriable error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn available(&self, product_id: &ProductId) -> u32 {
        self.state
            .lock()
            .await
            .available
            .get(product_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn reservation_count(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    pub async fn reservation_for(&self, order_id: AggregateId) -> Option<String> {
        self.state.lock().await.by_order.get(&order_id).cloned()
    }

    fn check_available(&self) -> Result<(), StepError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StepError::Failed("stock service unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StockReservations for InMemoryStockReservations {
    async fn reserve(
        &self,
        order_id: AggregateId,
        lines: &[OrderLine],
    ) -> Result<String, StepError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.by_order.get(&order_id) {
            return Ok(existing.clone());
        }

        for line in lines {
            let available = state.available.get(&line.product_id).copied().unwrap_or(0);
            if available < line.quantity {
                return Err(StepError::Rejected(format!(
                    "insufficient stock for {}: requested {}, available {available}",
                    line.product_id, line.quantity
                )));
            }
        }

        let mut quantities = Vec::with_capacity(lines.len());
        for line in lines {
            if let Some(available) = state.available.get_mut(&line.product_id) {
                *available -= line.quantity;
            }
            quantities.push((line.product_id.clone(), line.quantity));
        }

        let reservation_id = format!("res-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.reservations.insert(
            reservation_id.clone(),
            Reservation {
                order_id,
                quantities,
            },
        );
        state.by_order.insert(order_id, reservation_id.clone());
        tracing::debug!(%order_id, %reservation_id, "stock reserved");
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), StepError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(reservation) = state.reservations.remove(reservation_id) else {
            return Ok(());
        };
        state.by_order.remove(&reservation.order_id);
        for (product_id, quantity) in reservation.quantities {
            *state.available.entry(product_id).or_default() += quantity;
        }
        tracing::debug!(%reservation_id, "stock released");
        Ok(())
    }
}

/// Output of the reserve step.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reserved {
    reservation_id: String,
}

fn submitted(ctx: &StepContext<'_>) -> Result<(AggregateId, OrderSubmittedData), StepError> {
    let order_id = ctx
        .trigger()
        .map(|trigger| trigger.aggregate_id)
        .ok_or_else(|| StepError::Rejected("saga has no trigger".into()))?;
    match ctx.trigger_data::<OrderEvent>()? {
        OrderEvent::OrderSubmitted(data) => Ok((order_id, data)),
        other => Err(StepError::Rejected(format!(
            "expected OrderSubmitted, got {other:?}"
        ))),
    }
}

/// True when the order already is in `state`, so the command has nothing
/// left to do.
fn already(error: &DomainError, state: OrderState) -> bool {
    matches!(
        error,
        DomainError::Order(OrderError::InvalidStateTransition { current_state, .. })
            if *current_state == state
    )
}

/// Checks the submitted order. Its compensation cancels the order.
struct AcceptOrder;

#[async_trait]
impl SagaStep for AcceptOrder {
    fn name(&self) -> &'static str {
        "accept-order"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        let (_, order) = submitted(ctx)?;
        if order.lines.is_empty() {
            return Err(StepError::Rejected("submitted order has no lines".into()));
        }
        Ok(json!({ "lines": order.lines.len(), "total": order.total }))
    }

    async fn compensate(&self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        let (order_id, _) = submitted(ctx)?;
        let (commands, isolation) = (ctx.commands(), ctx.isolation());
        let result = retry_on_conflict(COMMAND_ATTEMPTS, move || {
            commands.dispatch(
                isolation,
                CancelOrder {
                    order_id,
                    reason: "order could not be fulfilled".into(),
                },
            )
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) if already(&error, OrderState::Cancelled) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

struct ReserveStock {
    stock: Arc<dyn StockReservations>,
}

#[async_trait]
impl SagaStep for ReserveStock {
    fn name(&self) -> &'static str {
        "reserve-stock"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        let (order_id, order) = submitted(ctx)?;
        let reservation_id = self.stock.reserve(order_id, &order.lines).await?;
        Ok(serde_json::to_value(Reserved { reservation_id })?)
    }

    async fn compensate(&self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        let reserved: Reserved = ctx.output(self.name())?;
        self.stock.release(&reserved.reservation_id).await
    }
}

struct ConfirmReservedOrder;

#[async_trait]
impl SagaStep for ConfirmReservedOrder {
    fn name(&self) -> &'static str {
        "confirm-order"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        let (order_id, _) = submitted(ctx)?;
        let reserved: Reserved = ctx.output("reserve-stock")?;
        let reservation_id = &reserved.reservation_id;
        let (commands, isolation) = (ctx.commands(), ctx.isolation());
        let result = retry_on_conflict(COMMAND_ATTEMPTS, move || {
            commands.dispatch(
                isolation,
                ConfirmOrder {
                    order_id,
                    reservation_id: Some(reservation_id.clone()),
                },
            )
        })
        .await;
        match result {
            Ok(version) => Ok(json!({ "version": version })),
            Err(error) if already(&error, OrderState::Confirmed) => Ok(Value::Null),
            Err(error) => Err(error.into()),
        }
    }
}

/// The fulfillment saga, started by `OrderSubmitted` and keyed by order id.
pub fn order_fulfillment(stock: Arc<dyn StockReservations>) -> SagaDefinition {
    SagaDefinition::new(ORDER_FULFILLMENT)
        .started_by("OrderSubmitted")
        .step(Arc::new(AcceptOrder))
        .step(Arc::new(ReserveStock { stock }))
        .step(Arc::new(ConfirmReservedOrder))
}

#[cfg(test)]
mod tests {
    use domain::order::Money;

    use super::*;

    fn line(product: &str, quantity: u32) -> OrderLine {
        OrderLine::new(product, product, quantity, Money::from_cents(100))
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_order() {
        let stock = InMemoryStockReservations::new().with_stock("SKU-1", 5);
        let order_id = AggregateId::new();

        let first = stock.reserve(order_id, &[line("SKU-1", 2)]).await.unwrap();
        let second = stock.reserve(order_id, &[line("SKU-1", 2)]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(stock.available(&"SKU-1".into()).await, 3);
    }

    #[tokio::test]
    async fn insufficient_stock_reserves_nothing() {
        let stock = InMemoryStockReservations::new()
            .with_stock("SKU-1", 5)
            .with_stock("SKU-2", 1);

        let error = stock
            .reserve(AggregateId::new(), &[line("SKU-1", 2), line("SKU-2", 3)])
            .await
            .unwrap_err();

        assert!(!error.is_retriable());
        assert_eq!(stock.available(&"SKU-1".into()).await, 5);
        assert_eq!(stock.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn release_restores_stock_once() {
        let stock = InMemoryStockReservations::new().with_stock("SKU-1", 5);
        let order_id = AggregateId::new();
        let reservation = stock.reserve(order_id, &[line("SKU-1", 4)]).await.unwrap();

        stock.release(&reservation).await.unwrap();
        stock.release(&reservation).await.unwrap();

        assert_eq!(stock.available(&"SKU-1".into()).await, 5);
        assert_eq!(stock.reservation_for(order_id).await, None);
    }

    #[tokio::test]
    async fn unavailable_service_fails_retriably() {
        let stock = InMemoryStockReservations::new().with_stock("SKU-1", 5);
        stock.set_unavailable(true);

        let error = stock
            .reserve(AggregateId::new(), &[line("SKU-1", 1)])
            .await
            .unwrap_err();
        assert!(error.is_retriable());
    }

    #[test]
    fn definition_lists_steps_in_order() {
        let definition = order_fulfillment(Arc::new(InMemoryStockReservations::new()));
        let names: Vec<_> = definition.steps().iter().map(|step| step.name()).collect();

        assert_eq!(names, ["accept-order", "reserve-stock", "confirm-order"]);
        assert!(definition.is_started_by("OrderSubmitted"));
    }
}
