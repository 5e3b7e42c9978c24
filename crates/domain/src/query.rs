//! Query trait and the query bus.
//!
//! Query handlers only read. They load aggregates or read models and never
//! call `save`.

use std::any::type_name;
use std::sync::Arc;

use async_trait::async_trait;
use common::IsolationContext;

use crate::error::DomainError;
use crate::registry::HandlerRegistry;

/// A read-only request.
pub trait Query: Send + Sync + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, isolation: &IsolationContext, query: Q)
    -> Result<Q::Output, DomainError>;
}

pub struct QueryBusBuilder {
    registry: HandlerRegistry,
}

impl QueryBusBuilder {
    /// Registers the handler for `Q`. Fails if `Q` already has one.
    pub fn register<Q: Query>(
        mut self,
        handler: Arc<dyn QueryHandler<Q>>,
    ) -> Result<Self, DomainError> {
        self.registry.insert::<Q, _>(handler)?;
        Ok(self)
    }

    pub fn build(self) -> QueryBus {
        QueryBus {
            registry: Arc::new(self.registry),
        }
    }
}

/// Dispatches each query to its single registered handler.
#[derive(Clone)]
pub struct QueryBus {
    registry: Arc<HandlerRegistry>,
}

impl QueryBus {
    pub fn builder() -> QueryBusBuilder {
        QueryBusBuilder {
            registry: HandlerRegistry::new("query"),
        }
    }

    pub fn registered(&self) -> Vec<&'static str> {
        self.registry.registered()
    }

    #[tracing::instrument(skip_all, fields(query = type_name::<Q>(), isolation = %isolation))]
    pub async fn dispatch<Q: Query>(
        &self,
        isolation: &IsolationContext,
        query: Q,
    ) -> Result<Q::Output, DomainError> {
        metrics::counter!("queries_dispatched_total", "query" => type_name::<Q>()).increment(1);
        let handler = self
            .registry
            .get::<Q, Arc<dyn QueryHandler<Q>>>()?
            .clone();
        handler.handle(isolation, query).await
    }
}
