//! Order commands, the order query, and their handlers.

use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IsolationContext};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::command::{Command, CommandBusBuilder, CommandHandler};
use crate::error::DomainError;
use crate::query::{Query, QueryBusBuilder, QueryHandler};
use crate::repository::Repository;

use super::{CustomerId, Money, Order, OrderError, OrderLine, OrderState, ProductId};

/// Places a new order in the caller's scope. The handler picks the id.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub customer_id: CustomerId,
}

impl PlaceOrder {
    pub fn for_customer(customer_id: CustomerId) -> Self {
        Self { customer_id }
    }
}

impl Command for PlaceOrder {
    type Output = AggregateId;
}

#[derive(Debug, Clone)]
pub struct AddLine {
    pub order_id: AggregateId,
    pub line: OrderLine,
}

impl AddLine {
    pub fn new(
        order_id: AggregateId,
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            order_id,
            line: OrderLine::new(product_id, product_name, quantity, unit_price),
        }
    }
}

impl Command for AddLine {
    type Output = Version;

    fn validate(&self) -> Result<(), DomainError> {
        if self.line.product_id.as_str().trim().is_empty() {
            return Err(DomainError::Validation("product id must not be empty".into()));
        }
        if self.line.quantity == 0 {
            return Err(DomainError::Validation("quantity must be at least 1".into()));
        }
        if !self.line.unit_price.is_positive() {
            return Err(DomainError::Validation("unit price must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RemoveLine {
    pub order_id: AggregateId,
    pub product_id: ProductId,
}

impl Command for RemoveLine {
    type Output = Version;
}

/// Sets a line's quantity; zero removes the line.
#[derive(Debug, Clone)]
pub struct ChangeLineQuantity {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
}

impl Command for ChangeLineQuantity {
    type Output = Version;
}

#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub order_id: AggregateId,
}

impl Command for SubmitOrder {
    type Output = Version;
}

#[derive(Debug, Clone)]
pub struct ConfirmOrder {
    pub order_id: AggregateId,
    pub reservation_id: Option<String>,
}

impl Command for ConfirmOrder {
    type Output = Version;
}

#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub reason: String,
}

impl Command for CancelOrder {
    type Output = Version;

    fn validate(&self) -> Result<(), DomainError> {
        if self.reason.trim().is_empty() {
            return Err(DomainError::Validation(
                "cancellation reason must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOrder {
    pub order_id: AggregateId,
}

impl Command for DeleteOrder {
    type Output = Version;
}

/// Reads one order. Deleted orders are not found.
#[derive(Debug, Clone)]
pub struct GetOrder {
    pub order_id: AggregateId,
}

impl Query for GetOrder {
    type Output = OrderView;
}

/// Read-side shape of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: AggregateId,
    pub version: Version,
    pub customer_id: Option<CustomerId>,
    pub state: OrderState,
    pub lines: Vec<OrderLine>,
    pub total: Money,
    pub isolation: IsolationContext,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            version: order.version(),
            customer_id: order.customer_id(),
            state: order.state(),
            lines: order.lines().cloned().collect(),
            total: order.total(),
            isolation: order.isolation().clone(),
        }
    }
}

/// Handles every order command and the order query.
#[derive(Clone)]
pub struct OrderHandler {
    repository: Repository<Order>,
}

impl OrderHandler {
    pub fn new(repository: Repository<Order>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Repository<Order> {
        &self.repository
    }

    /// Loads the order, applies `change`, and saves the result.
    async fn change<F>(
        &self,
        isolation: &IsolationContext,
        order_id: AggregateId,
        change: F,
    ) -> Result<Version, DomainError>
    where
        F: FnOnce(&mut Order) -> Result<(), OrderError> + Send,
    {
        let mut order = self.repository.load(order_id, isolation).await?;
        change(&mut order)?;
        Ok(self.repository.save(&mut order).await?.version)
    }
}

#[async_trait]
impl CommandHandler<PlaceOrder> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: PlaceOrder,
    ) -> Result<AggregateId, DomainError> {
        let order_id = self.repository.next_id();
        let mut order = Order::place(order_id, isolation.clone(), command.customer_id);
        self.repository.save(&mut order).await?;
        tracing::info!(%order_id, "order placed");
        Ok(order_id)
    }
}

#[async_trait]
impl CommandHandler<AddLine> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: AddLine,
    ) -> Result<Version, DomainError> {
        let line = command.line;
        self.change(isolation, command.order_id, |order| order.add_line(line))
            .await
    }
}

#[async_trait]
impl CommandHandler<RemoveLine> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: RemoveLine,
    ) -> Result<Version, DomainError> {
        let product_id = command.product_id;
        self.change(isolation, command.order_id, |order| {
            order.remove_line(product_id)
        })
        .await
    }
}

#[async_trait]
impl CommandHandler<ChangeLineQuantity> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: ChangeLineQuantity,
    ) -> Result<Version, DomainError> {
        let (product_id, quantity) = (command.product_id, command.quantity);
        self.change(isolation, command.order_id, |order| {
            order.change_quantity(product_id, quantity)
        })
        .await
    }
}

#[async_trait]
impl CommandHandler<SubmitOrder> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: SubmitOrder,
    ) -> Result<Version, DomainError> {
        self.change(isolation, command.order_id, Order::submit).await
    }
}

#[async_trait]
impl CommandHandler<ConfirmOrder> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: ConfirmOrder,
    ) -> Result<Version, DomainError> {
        let reservation_id = command.reservation_id;
        self.change(isolation, command.order_id, |order| {
            order.confirm(reservation_id)
        })
        .await
    }
}

#[async_trait]
impl CommandHandler<CancelOrder> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: CancelOrder,
    ) -> Result<Version, DomainError> {
        let reason = command.reason;
        self.change(isolation, command.order_id, |order| order.cancel(reason))
            .await
    }
}

#[async_trait]
impl CommandHandler<DeleteOrder> for OrderHandler {
    #[tracing::instrument(skip(self, isolation))]
    async fn handle(
        &self,
        isolation: &IsolationContext,
        command: DeleteOrder,
    ) -> Result<Version, DomainError> {
        self.change(isolation, command.order_id, Order::delete).await
    }
}

#[async_trait]
impl QueryHandler<GetOrder> for OrderHandler {
    async fn handle(
        &self,
        isolation: &IsolationContext,
        query: GetOrder,
    ) -> Result<OrderView, DomainError> {
        let order = self.repository.load(query.order_id, isolation).await?;
        Ok(OrderView::from(&order))
    }
}

/// Registers the order handlers on both buses.
pub fn register(
    commands: CommandBusBuilder,
    queries: QueryBusBuilder,
    repository: Repository<Order>,
) -> Result<(CommandBusBuilder, QueryBusBuilder), DomainError> {
    let handler = Arc::new(OrderHandler::new(repository));
    let commands = commands
        .register::<PlaceOrder>(handler.clone())?
        .register::<AddLine>(handler.clone())?
        .register::<RemoveLine>(handler.clone())?
        .register::<ChangeLineQuantity>(handler.clone())?
        .register::<SubmitOrder>(handler.clone())?
        .register::<ConfirmOrder>(handler.clone())?
        .register::<CancelOrder>(handler.clone())?
        .register::<DeleteOrder>(handler.clone())?;
    let queries = queries.register::<GetOrder>(handler)?;
    Ok((commands, queries))
}
