//! Integration tests for the order module and the repository.
//!
//! These tests drive orders through the buses and the repository against
//! the in-memory store: load/save lifecycle, concurrency, isolation, soft
//! delete, snapshots, and replay determinism.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{AggregateId, FixedClock, IsolationContext, SequentialIdGenerator};
use domain::order::{
    self, AddLine, CancelOrder, ChangeLineQuantity, ConfirmOrder, CustomerId, DeleteOrder,
    GetOrder, Money, OrderLine, PlaceOrder, SubmitOrder,
};
use domain::{
    Aggregate, CommandBus, DomainError, Order, OrderState, QueryBus, Repository,
    retry_on_conflict,
};
use event_bus::{EventBus, EventHandler, EventHandlerError};
use event_store::{
    EventEnvelope, EventQuery, EventStore, EventStoreExt, EventStream, InMemoryEventStore,
    InMemorySnapshotStore, NewEvent, Snapshot, SnapshotStore, Version,
};

fn tenant() -> IsolationContext {
    IsolationContext::tenant("acme").unwrap()
}

fn widget(quantity: u32) -> OrderLine {
    OrderLine::new("SKU-001", "Widget", quantity, Money::from_cents(1000))
}

fn repository(store: &InMemoryEventStore) -> Repository<Order> {
    Repository::new(Arc::new(store.clone())).with_clock(Arc::new(FixedClock::default()))
}

fn buses(store: &InMemoryEventStore) -> (CommandBus, QueryBus) {
    let (commands, queries) =
        order::register(CommandBus::builder(), QueryBus::builder(), repository(store)).unwrap();
    (commands.build(), queries.build())
}

/// Saves a placed order with one line, leaving it at version 2.
async fn seeded_order(repo: &Repository<Order>, isolation: IsolationContext) -> AggregateId {
    let id = AggregateId::new();
    let mut order = Order::place(id, isolation, CustomerId::new());
    order.add_line(widget(1)).unwrap();
    repo.save(&mut order).await.unwrap();
    id
}

mod order_lifecycle {
    use super::*;

    #[tokio::test]
    async fn commands_and_queries_through_the_buses() {
        let store = InMemoryEventStore::new();
        let (commands, queries) = buses(&store);
        let ctx = tenant();

        let order_id = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();
        commands
            .dispatch(
                &ctx,
                AddLine::new(order_id, "SKU-001", "Widget", 2, Money::from_cents(1000)),
            )
            .await
            .unwrap();
        commands
            .dispatch(
                &ctx,
                AddLine::new(order_id, "SKU-002", "Gadget", 1, Money::from_cents(500)),
            )
            .await
            .unwrap();
        commands
            .dispatch(
                &ctx,
                ChangeLineQuantity {
                    order_id,
                    product_id: "SKU-001".into(),
                    quantity: 3,
                },
            )
            .await
            .unwrap();
        commands
            .dispatch(&ctx, SubmitOrder { order_id })
            .await
            .unwrap();
        let version = commands
            .dispatch(
                &ctx,
                ConfirmOrder {
                    order_id,
                    reservation_id: Some("RES-1".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(version, Version::new(6));

        let view = queries.dispatch(&ctx, GetOrder { order_id }).await.unwrap();
        assert_eq!(view.state, OrderState::Confirmed);
        assert_eq!(view.total.cents(), 3500);
        assert_eq!(view.lines.len(), 2);
        assert_eq!(view.version, Version::new(6));
        assert_eq!(view.isolation, ctx);
    }

    #[tokio::test]
    async fn placed_orders_take_ids_from_the_generator() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store)
            .with_id_generator(Arc::new(SequentialIdGenerator::starting_at(7)));
        let (commands, queries) =
            order::register(CommandBus::builder(), QueryBus::builder(), repo).unwrap();
        let (commands, queries) = (commands.build(), queries.build());
        let ctx = tenant();

        let first = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();
        let second = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();

        assert_eq!(first, AggregateId::from_uuid(uuid::Uuid::from_u128(7)));
        assert_eq!(second, AggregateId::from_uuid(uuid::Uuid::from_u128(8)));
        let view = queries.dispatch(&ctx, GetOrder { order_id: second }).await.unwrap();
        assert_eq!(view.state, OrderState::Draft);
    }

    #[tokio::test]
    async fn validation_fails_before_the_store_is_touched() {
        let store = InMemoryEventStore::new();
        let (commands, _) = buses(&store);
        let ctx = tenant();
        let order_id = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();

        let error = commands
            .dispatch(
                &ctx,
                AddLine::new(order_id, "SKU-001", "Widget", 0, Money::from_cents(1000)),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, DomainError::Validation(_)));
        assert!(!error.is_retriable());
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn business_rule_violations_are_order_errors() {
        let store = InMemoryEventStore::new();
        let (commands, _) = buses(&store);
        let ctx = tenant();
        let order_id = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();

        let error = commands
            .dispatch(&ctx, SubmitOrder { order_id })
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DomainError::Order(domain::OrderError::NoLines)
        ));
    }

    #[tokio::test]
    async fn deleted_orders_are_not_found() {
        let store = InMemoryEventStore::new();
        let (commands, queries) = buses(&store);
        let ctx = tenant();
        let order_id = commands
            .dispatch(&ctx, PlaceOrder::for_customer(CustomerId::new()))
            .await
            .unwrap();
        commands
            .dispatch(
                &ctx,
                CancelOrder {
                    order_id,
                    reason: "duplicate".into(),
                },
            )
            .await
            .unwrap();
        commands
            .dispatch(&ctx, DeleteOrder { order_id })
            .await
            .unwrap();

        let error = queries
            .dispatch(&ctx, GetOrder { order_id })
            .await
            .unwrap_err();
        assert!(matches!(error, DomainError::NotFound { .. }));

        let deleted = repository(&store)
            .load_including_deleted(order_id, &ctx)
            .await
            .unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.state(), OrderState::Cancelled);
        assert_eq!(store.read_all(order_id).await.unwrap().len(), 3);
    }
}

mod repository_scenarios {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn create_then_reload() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = AggregateId::new();
        let customer = CustomerId::new();

        let mut order = Order::place(id, tenant(), customer);
        let outcome = repo.save(&mut order).await.unwrap();

        assert_eq!(outcome.version, Version::first());
        assert_eq!(order.version(), Version::first());
        assert!(order.uncommitted_events().is_empty());

        let reloaded = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(reloaded.version(), Version::first());
        assert_eq!(reloaded.state(), OrderState::Draft);
        assert_eq!(reloaded.customer_id(), Some(customer));
        assert_eq!(reloaded.line_count(), 0);
    }

    #[tokio::test]
    async fn stale_save_gets_a_conflict() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = AggregateId::new();
        repo.save(&mut Order::place(id, tenant(), CustomerId::new()))
            .await
            .unwrap();

        let mut first = repo.load(id, &tenant()).await.unwrap();
        let mut second = repo.load(id, &tenant()).await.unwrap();
        first.add_line(widget(1)).unwrap();
        second.add_line(widget(2)).unwrap();

        let saved = repo.save(&mut first).await.unwrap();
        assert_eq!(saved.version, Version::new(2));

        let error = repo.save(&mut second).await.unwrap_err();
        assert!(error.is_retriable());
        assert!(matches!(
            error,
            DomainError::ConcurrencyConflict { expected, actual, .. }
                if expected == Version::new(1) && actual == Version::new(2)
        ));
        assert_eq!(second.version(), Version::new(1));
        assert_eq!(second.uncommitted_events().len(), 1);

        let current = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(current.line(&"SKU-001".into()).unwrap().quantity, 1);
    }

    #[tokio::test]
    async fn concurrent_saves_have_one_winner() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;

        let mut tasks = Vec::new();
        for quantity in 1..=4 {
            let repo = repo.clone();
            let mut order = repo.load(id, &tenant()).await.unwrap();
            tasks.push(tokio::spawn(async move {
                order.change_quantity("SKU-001".into(), quantity + 1).unwrap();
                repo.save(&mut order).await.map(|outcome| outcome.version)
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, Version::new(3));
                    winners += 1;
                }
                Err(error) => assert!(error.is_retriable()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn retry_reloads_and_reapplies() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;

        let mut stale = repo.load(id, &tenant()).await.unwrap();
        let mut winner = repo.load(id, &tenant()).await.unwrap();
        winner.add_line(widget(1)).unwrap();
        repo.save(&mut winner).await.unwrap();

        stale.add_line(widget(5)).unwrap();
        assert!(repo.save(&mut stale).await.unwrap_err().is_retriable());

        let version = retry_on_conflict(3, || async {
            let mut order = repo.load(id, &tenant()).await?;
            order.add_line(widget(5))?;
            Ok(repo.save(&mut order).await?.version)
        })
        .await
        .unwrap();

        assert_eq!(version, Version::new(4));
        let order = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(order.line(&"SKU-001".into()).unwrap().quantity, 7);
    }

    #[tokio::test]
    async fn sibling_organization_is_denied() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, IsolationContext::organization("t", "o2").unwrap()).await;

        let department = IsolationContext::department("t", "o", "d").unwrap();
        let error = repo.load(id, &department).await.unwrap_err();
        assert!(matches!(error, DomainError::UnauthorizedAccess { aggregate_id, .. } if aggregate_id == id));

        let other_tenant = IsolationContext::tenant("u").unwrap();
        assert!(matches!(
            repo.load(id, &other_tenant).await,
            Err(DomainError::UnauthorizedAccess { .. })
        ));

        assert!(repo.load(id, &IsolationContext::tenant("t").unwrap()).await.is_ok());
        assert!(repo.load(id, &IsolationContext::platform()).await.is_ok());
    }

    #[tokio::test]
    async fn deeper_context_cannot_see_its_ancestors_aggregate() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;

        let user = IsolationContext::user("acme", "o", "d", "u").unwrap();
        assert!(matches!(
            repo.load(id, &user).await,
            Err(DomainError::UnauthorizedAccess { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_aggregate_is_not_found() {
        let store = InMemoryEventStore::new();
        let error = repository(&store)
            .load(AggregateId::new(), &tenant())
            .await
            .unwrap_err();
        assert!(matches!(error, DomainError::NotFound { aggregate_type: "Order", .. }));
    }

    #[tokio::test]
    async fn creating_over_a_taken_id_reveals_nothing_and_is_not_retried() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;
        let globex = IsolationContext::tenant("globex").unwrap();

        let attempts = AtomicU32::new(0);
        let error = retry_on_conflict(3, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            let mut order = Order::place(id, globex.clone(), CustomerId::new());
            Ok(repo.save(&mut order).await?.version)
        })
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            DomainError::AlreadyExists { aggregate_type: "Order", aggregate_id } if aggregate_id == id
        ));
        assert!(!error.is_retriable());
        assert!(!error.to_string().contains("version"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let untouched = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(untouched.version(), Version::new(2));
        assert_eq!(untouched.isolation(), &tenant());
    }

    /// Serves streams with one version left out.
    struct GappedStore {
        inner: InMemoryEventStore,
        missing: Version,
    }

    #[async_trait]
    impl EventStore for GappedStore {
        async fn append(
            &self,
            aggregate_id: AggregateId,
            expected_version: Version,
            events: Vec<NewEvent>,
        ) -> event_store::Result<Vec<EventEnvelope>> {
            self.inner.append(aggregate_id, expected_version, events).await
        }

        async fn read_stream(
            &self,
            aggregate_id: AggregateId,
            from_version: Version,
        ) -> event_store::Result<EventStream> {
            let missing = self.missing;
            let stream = self.inner.read_stream(aggregate_id, from_version).await?;
            Ok(Box::pin(stream.try_filter(move |event| {
                futures_util::future::ready(event.version != missing)
            })))
        }

        async fn current_version(
            &self,
            aggregate_id: AggregateId,
        ) -> event_store::Result<Option<Version>> {
            self.inner.current_version(aggregate_id).await
        }

        async fn query_events(&self, query: EventQuery) -> event_store::Result<Vec<EventEnvelope>> {
            self.inner.query_events(query).await
        }

        async fn stream_all_events(&self, after_position: i64) -> event_store::Result<EventStream> {
            self.inner.stream_all_events(after_position).await
        }
    }

    #[tokio::test]
    async fn gap_in_the_stream_is_reported_as_corruption() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;
        let mut order = repo.load(id, &tenant()).await.unwrap();
        order.add_line(widget(4)).unwrap();
        repo.save(&mut order).await.unwrap();

        let gapped: Repository<Order> = Repository::new(Arc::new(GappedStore {
            inner: store.clone(),
            missing: Version::new(2),
        }));
        let error = gapped.load(id, &tenant()).await.unwrap_err();

        assert!(matches!(
            error,
            DomainError::StreamCorrupted { aggregate_id, expected, found }
                if aggregate_id == id && expected == Version::new(2) && found == Version::new(3)
        ));
        assert!(!error.is_retriable());
    }

    #[tokio::test]
    async fn committed_events_carry_scope_type_and_metadata() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = AggregateId::new();
        let mut order = Order::place(id, tenant(), CustomerId::new());
        order.add_line(widget(1)).unwrap();

        let metadata = [("correlation_id".to_string(), serde_json::json!("c-1"))]
            .into_iter()
            .collect();
        let outcome = repo.save_with_metadata(&mut order, metadata).await.unwrap();

        let types: Vec<_> = outcome.committed.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["OrderPlaced", "OrderLineAdded"]);
        for event in &outcome.committed {
            assert_eq!(event.aggregate_type, "Order");
            assert_eq!(event.isolation, tenant());
            assert_eq!(event.metadata_str("correlation_id"), Some("c-1"));
        }
    }

    #[tokio::test]
    async fn saving_nothing_writes_nothing() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let id = seeded_order(&repo, tenant()).await;

        let mut order = repo.load(id, &tenant()).await.unwrap();
        let outcome = repo.save(&mut order).await.unwrap();

        assert_eq!(outcome.version, Version::new(2));
        assert!(outcome.committed.is_empty());
        assert_eq!(store.event_count().await, 2);
    }
}

mod publication {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &EventEnvelope) -> Result<(), EventHandlerError> {
            self.seen
                .lock()
                .unwrap()
                .push((event.event_type.clone(), event.version.as_i64()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn committed_batches_reach_subscribers() {
        let store = InMemoryEventStore::new();
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::builder()
            .subscribe_all(recorder.clone())
            .build()
            .unwrap();
        let repo = repository(&store).with_event_bus(bus.clone());

        let mut order = Order::place(AggregateId::new(), tenant(), CustomerId::new());
        order.add_line(widget(1)).unwrap();
        let outcome = repo.save(&mut order).await.unwrap();

        let reports = outcome.delivery.wait().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].delivered, 2);

        order.submit().unwrap();
        let _ = repo.save(&mut order).await.unwrap();
        bus.wait_idle().await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            [
                ("OrderPlaced".to_string(), 1),
                ("OrderLineAdded".to_string(), 2),
                ("OrderSubmitted".to_string(), 3),
            ]
        );
    }

    #[tokio::test]
    async fn failed_saves_publish_nothing() {
        let store = InMemoryEventStore::new();
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::builder()
            .subscribe_all(recorder.clone())
            .build()
            .unwrap();
        let repo = repository(&store).with_event_bus(bus.clone());
        let id = seeded_order(&repo, tenant()).await;
        bus.wait_idle().await;

        let mut stale = repo.load(id, &tenant()).await.unwrap();
        let mut winner = repo.load(id, &tenant()).await.unwrap();
        winner.submit().unwrap();
        repo.save(&mut winner).await.unwrap();
        stale.cancel("too slow").unwrap();
        assert!(repo.save(&mut stale).await.is_err());
        bus.wait_idle().await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(event_type, _)| event_type != "OrderCancelled"));
    }
}

mod snapshots {
    use super::*;

    async fn busy_order(repo: &Repository<Order>) -> AggregateId {
        let id = AggregateId::new();
        let mut order = Order::place(id, tenant(), CustomerId::new());
        repo.save(&mut order).await.unwrap();
        for quantity in 1..=10 {
            let mut order = repo.load(id, &tenant()).await.unwrap();
            order
                .add_line(OrderLine::new(
                    format!("SKU-{}", quantity % 3),
                    "Part",
                    quantity,
                    Money::from_cents(100 * i64::from(quantity)),
                ))
                .unwrap();
            repo.save(&mut order).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn load_is_identical_with_and_without_snapshots() {
        let store = InMemoryEventStore::new();
        let snapshots = InMemorySnapshotStore::new();
        let with_snapshots =
            repository(&store).with_snapshot_interval(Arc::new(snapshots.clone()), 4);
        let without_snapshots = repository(&store);

        let id = busy_order(&with_snapshots).await;

        let stored = snapshots.load(id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version::new(8));
        assert_eq!(stored.aggregate_type, "Order");

        let fast = with_snapshots.load(id, &tenant()).await.unwrap();
        let slow = without_snapshots.load(id, &tenant()).await.unwrap();
        assert_eq!(fast, slow);
        assert_eq!(fast.version(), Version::new(11));
        assert_eq!(
            serde_json::to_string(&fast).unwrap(),
            serde_json::to_string(&slow).unwrap()
        );
    }

    #[tokio::test]
    async fn snapshot_scope_is_still_checked() {
        let store = InMemoryEventStore::new();
        let snapshots = InMemorySnapshotStore::new();
        let repo = repository(&store).with_snapshot_interval(Arc::new(snapshots.clone()), 1);
        let id = seeded_order(&repo, tenant()).await;
        assert!(!snapshots.is_empty().await);

        let stranger = IsolationContext::tenant("globex").unwrap();
        assert!(matches!(
            repo.load(id, &stranger).await,
            Err(DomainError::UnauthorizedAccess { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_ahead_of_the_stream_is_discarded() {
        let store = InMemoryEventStore::new();
        let snapshots = InMemorySnapshotStore::new();
        let repo = repository(&store).with_snapshot_interval(Arc::new(snapshots.clone()), 1000);
        let id = seeded_order(&repo, tenant()).await;
        let order = repo.load(id, &tenant()).await.unwrap();

        snapshots
            .save(Snapshot {
                aggregate_id: id,
                aggregate_type: "Order".into(),
                version: Version::new(7),
                taken_at: chrono::Utc::now(),
                state: serde_json::to_value(&order).unwrap(),
            })
            .await
            .unwrap();

        let mut loaded = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(loaded.version(), Version::new(2));
        assert_eq!(loaded.line_count(), 1);

        loaded
            .add_line(OrderLine::new("SKU-002", "Gadget", 1, Money::from_cents(500)))
            .unwrap();
        assert_eq!(repo.save(&mut loaded).await.unwrap().version, Version::new(3));
    }

    #[tokio::test]
    async fn unreadable_snapshot_falls_back_to_full_replay() {
        let store = InMemoryEventStore::new();
        let snapshots = InMemorySnapshotStore::new();
        let repo = repository(&store).with_snapshot_interval(Arc::new(snapshots.clone()), 1000);
        let id = seeded_order(&repo, tenant()).await;

        snapshots
            .save(Snapshot {
                aggregate_id: id,
                aggregate_type: "Order".into(),
                version: Version::new(1),
                taken_at: chrono::Utc::now(),
                state: serde_json::json!({ "not": "an order" }),
            })
            .await
            .unwrap();

        let order = repo.load(id, &tenant()).await.unwrap();
        assert_eq!(order.version(), Version::new(2));
        assert_eq!(order.line_count(), 1);
    }
}

mod replay {
    use domain::DomainEvent;
    use futures_util::TryStreamExt;
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u32),
        Remove(u8),
        Change(u8, u32),
        Submit,
        Cancel,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..4, 1u32..5).prop_map(|(product, quantity)| Op::Add(product, quantity)),
            2 => (0u8..4).prop_map(Op::Remove),
            2 => (0u8..4, 0u32..5).prop_map(|(product, quantity)| Op::Change(product, quantity)),
            1 => Just(Op::Submit),
            1 => Just(Op::Cancel),
        ]
    }

    /// Runs the operations, ignoring the ones the order rejects.
    fn run(ops: &[Op]) -> Order {
        let mut order = Order::place(AggregateId::new(), tenant(), CustomerId::new());
        for op in ops {
            let _ = match op {
                Op::Add(product, quantity) => order.add_line(OrderLine::new(
                    format!("SKU-{product}"),
                    "Part",
                    *quantity,
                    Money::from_cents(250),
                )),
                Op::Remove(product) => order.remove_line(format!("SKU-{product}").into()),
                Op::Change(product, quantity) => {
                    order.change_quantity(format!("SKU-{product}").into(), *quantity)
                }
                Op::Submit => order.submit(),
                Op::Cancel => order.cancel("changed mind"),
            };
        }
        order
    }

    fn fold(order: &Order) -> Order {
        let mut replayed = Order::blank(order.id(), order.isolation().clone());
        for (index, event) in order.uncommitted_events().iter().enumerate() {
            replayed.replay(event, Version::initial().advance(index + 1));
        }
        replayed
    }

    proptest! {
        #[test]
        fn folding_twice_is_bit_identical(ops in prop::collection::vec(op(), 0..40)) {
            let order = run(&ops);
            let first = serde_json::to_string(&fold(&order)).unwrap();
            let second = serde_json::to_string(&fold(&order)).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn replay_matches_the_live_state(ops in prop::collection::vec(op(), 0..40)) {
            let order = run(&ops);
            let replayed = fold(&order);
            prop_assert_eq!(replayed.state(), order.state());
            prop_assert_eq!(replayed.total(), order.total());
            prop_assert_eq!(replayed.lines().collect::<Vec<_>>(), order.lines().collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn stored_streams_have_consecutive_versions() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store);
        let mut order = run(&[
            Op::Add(0, 2),
            Op::Add(1, 1),
            Op::Change(0, 4),
            Op::Remove(1),
            Op::Submit,
        ]);
        let pending: Vec<_> = order
            .uncommitted_events()
            .iter()
            .map(|event| event.event_type())
            .collect();
        repo.save(&mut order).await.unwrap();

        let stored: Vec<_> = store
            .read_stream(order.id(), Version::first())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let versions: Vec<_> = stored.iter().map(|event| event.version.as_i64()).collect();
        assert_eq!(versions, (1..=pending.len() as i64).collect::<Vec<_>>());
        let types: Vec<_> = stored.iter().map(|event| event.event_type.as_str()).collect();
        assert_eq!(types, pending);
    }
}
