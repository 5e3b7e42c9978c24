//! Wiring for the event-sourcing platform.
//!
//! [`Platform`] connects the stores, the event bus, the command and query
//! buses with the order module, and the saga manager. The worker binary
//! builds one from [`Config`], resumes interrupted work, and drains the bus
//! on shutdown.

pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;

use common::IsolationContext;
use domain::order::{self, Order};
use domain::{
    Command, CommandBus, DomainError, Query, QueryBus, Repository, retry_on_conflict,
};
use event_bus::{EventBus, InMemoryLedger, catch_up};
use event_store::{
    EventStore, InMemoryEventStore, InMemorySnapshotStore, PostgresEventStore,
    PostgresSnapshotStore, SnapshotStore,
};
use saga::{SagaManager, SagaInstance, StockReservations, order_fulfillment};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use config::{Config, LogFormat};
pub use error::{Result, RuntimeError};

const CATCH_UP_BATCH: usize = 500;

/// What [`Platform::start`] recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Non-terminal sagas driven on.
    pub resumed_sagas: usize,
    /// Committed events re-published to the bus.
    pub replayed_events: usize,
}

/// The assembled platform.
pub struct Platform {
    config: Config,
    events: Arc<dyn EventStore>,
    bus: EventBus,
    commands: CommandBus,
    queries: QueryBus,
    sagas: SagaManager,
}

impl Platform {
    /// Builds the platform on PostgreSQL when `database_url` is set, and on
    /// in-memory stores otherwise.
    pub async fn connect(config: Config, stock: Arc<dyn StockReservations>) -> Result<Self> {
        let Some(url) = config.database_url.clone() else {
            info!("using in-memory stores");
            return Self::in_memory(config, stock);
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&url)
            .await?;
        let events = PostgresEventStore::new(pool.clone());
        events.run_migrations().await?;
        info!("using PostgreSQL stores");

        Self::build(
            config,
            Arc::new(events),
            Arc::new(PostgresSnapshotStore::new(pool)),
            stock,
        )
    }

    pub fn in_memory(config: Config, stock: Arc<dyn StockReservations>) -> Result<Self> {
        Self::build(
            config,
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            stock,
        )
    }

    /// Wires everything over the given stores.
    ///
    /// The saga manager subscribes to the bus before the order repository
    /// publishes on it; its command bus is connected last.
    pub fn build(
        config: Config,
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        stock: Arc<dyn StockReservations>,
    ) -> Result<Self> {
        let sagas = SagaManager::builder(Repository::<SagaInstance>::new(events.clone()))
            .policy(config.saga_policy())
            .definition(order_fulfillment(stock))
            .build()?;

        let bus = EventBus::builder()
            .subscribe(sagas.event_types(), Arc::new(sagas.clone()))
            .with_ledger(Arc::new(InMemoryLedger::new(config.ledger_capacity)))
            .default_retry_policy(config.retry_policy())
            .build()?;

        let mut orders = Repository::<Order>::new(events.clone()).with_event_bus(bus.clone());
        if config.snapshots_enabled {
            orders = orders.with_snapshots(snapshots);
        }

        let (commands, queries) = order::register(CommandBus::builder(), QueryBus::builder(), orders)?;
        let commands = commands.build();
        sagas.connect(commands.clone());

        Ok(Self {
            config,
            events,
            bus,
            commands,
            queries: queries.build(),
            sagas,
        })
    }

    /// Resumes interrupted sagas, then re-publishes the committed log so
    /// events whose delivery was cut short reach their subscribers.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<StartupReport> {
        let resumed_sagas = self.sagas.resume_in_flight().await?;
        let replayed = catch_up(&self.bus, self.events.as_ref(), 0, CATCH_UP_BATCH).await?;

        let report = StartupReport {
            resumed_sagas,
            replayed_events: replayed.events,
        };
        info!(
            resumed_sagas,
            replayed_events = replayed.events,
            duplicates = replayed.duplicates,
            failures = replayed.failures,
            "platform started"
        );
        Ok(report)
    }

    /// Dispatches a command, retrying the whole use case on a concurrency
    /// conflict up to `conflict_retry_limit` times.
    pub async fn execute<C>(
        &self,
        isolation: &IsolationContext,
        command: C,
    ) -> std::result::Result<C::Output, DomainError>
    where
        C: Command + Clone,
    {
        let commands = &self.commands;
        let command = &command;
        retry_on_conflict(self.config.conflict_retry_limit, move || {
            commands.dispatch(isolation, command.clone())
        })
        .await
    }

    pub async fn query<Q: Query>(
        &self,
        isolation: &IsolationContext,
        query: Q,
    ) -> std::result::Result<Q::Output, DomainError> {
        self.queries.dispatch(isolation, query).await
    }

    /// Waits for every in-flight delivery, including saga work it started.
    pub async fn shutdown(&self) {
        info!(in_flight = self.bus.in_flight(), "draining event bus");
        self.bus.wait_idle().await;
        info!("platform stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    pub fn queries(&self) -> &QueryBus {
        &self.queries
    }

    pub fn sagas(&self) -> &SagaManager {
        &self.sagas
    }
}
