//! Load/replay/save lifecycle for aggregates.

use std::collections::HashMap;
use std::sync::Arc;

use common::{AggregateId, Clock, IdGenerator, IsolationContext, RandomIdGenerator, SystemClock};
use event_bus::{DeliveryHandle, EventBus};
use event_store::{EventEnvelope, EventStore, NewEvent, Snapshot, SnapshotStore, Version};
use futures_util::TryStreamExt;

use crate::aggregate::{Aggregate, DomainEvent, SnapshotCapable, crosses_snapshot_boundary};
use crate::error::DomainError;

struct Snapshotting<A> {
    store: Arc<dyn SnapshotStore>,
    interval: u64,
    encode: fn(&A) -> serde_json::Result<serde_json::Value>,
    decode: fn(serde_json::Value) -> serde_json::Result<A>,
}

impl<A> Clone for Snapshotting<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            interval: self.interval,
            encode: self.encode,
            decode: self.decode,
        }
    }
}

/// Result of a successful [`Repository::save`].
#[derive(Debug)]
pub struct SaveOutcome {
    /// Version of the last event written.
    pub version: Version,
    /// The events as stored, in version order.
    pub committed: Vec<EventEnvelope>,
    /// Publication of `committed` to subscribers. Dropping it does not
    /// cancel delivery.
    pub delivery: DeliveryHandle,
}

/// Repository for one aggregate type.
///
/// Loads replay the latest snapshot plus the events after it; saves append
/// the uncommitted events under an optimistic-concurrency check and hand
/// the committed events to the event bus.
pub struct Repository<A: Aggregate> {
    store: Arc<dyn EventStore>,
    snapshots: Option<Snapshotting<A>>,
    bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl<A: Aggregate> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            snapshots: self.snapshots.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<A: Aggregate> Repository<A> {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            snapshots: None,
            bus: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIdGenerator),
        }
    }

    /// Uses `clock` for `occurred_at` and snapshot timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `ids` for the identifiers handed out by [`Repository::next_id`].
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Publishes every committed batch on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Enables snapshotting every [`SnapshotCapable::snapshot_interval`] events.
    pub fn with_snapshots(self, store: Arc<dyn SnapshotStore>) -> Self
    where
        A: SnapshotCapable,
    {
        self.with_snapshot_interval(store, A::snapshot_interval())
    }

    pub fn with_snapshot_interval(mut self, store: Arc<dyn SnapshotStore>, interval: u64) -> Self
    where
        A: SnapshotCapable,
    {
        self.snapshots = Some(Snapshotting {
            store,
            interval: interval.max(1),
            encode: |aggregate| serde_json::to_value(aggregate),
            decode: serde_json::from_value,
        });
        self
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A fresh identifier for an aggregate about to be created.
    pub fn next_id(&self) -> AggregateId {
        self.ids.next_id()
    }

    /// Loads an aggregate the caller's context may see.
    ///
    /// Fails with `NotFound` if no event exists or the aggregate was
    /// deleted, and with `UnauthorizedAccess` if `isolation` does not
    /// contain the aggregate's scope.
    pub async fn load(
        &self,
        id: AggregateId,
        isolation: &IsolationContext,
    ) -> Result<A, DomainError> {
        let aggregate = self.load_including_deleted(id, isolation).await?;
        if aggregate.is_deleted() {
            return Err(not_found::<A>(id));
        }
        Ok(aggregate)
    }

    /// Like [`Repository::load`], but returns soft-deleted aggregates too.
    #[tracing::instrument(skip(self, isolation), fields(aggregate_type = A::aggregate_type(), isolation = %isolation))]
    pub async fn load_including_deleted(
        &self,
        id: AggregateId,
        isolation: &IsolationContext,
    ) -> Result<A, DomainError> {
        metrics::counter!("repository_loads_total", "aggregate_type" => A::aggregate_type())
            .increment(1);

        let restored = self.restore_snapshot(id).await;
        if let Some(restored) = &restored {
            authorize::<A>(id, restored.isolation(), isolation)?;
        }
        let snapshot_version = restored.as_ref().map(|restored| restored.version());

        let (mut aggregate, mut replayed) = self.replay(id, isolation, restored).await?;

        // A snapshot with nothing after it must sit exactly at the stream head.
        if let Some(version) = snapshot_version
            && replayed == 0
        {
            let head = self.store.current_version(id).await?;
            if head != Some(version) {
                tracing::warn!(
                    aggregate_id = %id,
                    snapshot = %version,
                    head = ?head,
                    "snapshot does not match the stream head, replaying full stream"
                );
                (aggregate, replayed) = self.replay(id, isolation, None).await?;
            }
        }

        metrics::histogram!("repository_events_replayed", "aggregate_type" => A::aggregate_type())
            .record(replayed as f64);
        aggregate.ok_or_else(|| not_found::<A>(id))
    }

    /// Applies the stored events after `aggregate`'s version, or the whole
    /// stream when `aggregate` is `None`. Returns the state and the number of
    /// events applied.
    async fn replay(
        &self,
        id: AggregateId,
        isolation: &IsolationContext,
        mut aggregate: Option<A>,
    ) -> Result<(Option<A>, u64), DomainError> {
        let from = aggregate
            .as_ref()
            .map_or(Version::first(), |restored| restored.version().next());
        let mut stream = self.store.read_stream(id, from).await?;
        let mut replayed = 0u64;

        while let Some(envelope) = stream.try_next().await? {
            let expected = aggregate
                .as_ref()
                .map_or(Version::first(), |current| current.version().next());
            if envelope.version != expected {
                return Err(DomainError::StreamCorrupted {
                    aggregate_id: id,
                    expected,
                    found: envelope.version,
                });
            }

            if aggregate.is_none() {
                authorize::<A>(id, &envelope.isolation, isolation)?;
            }
            let current =
                aggregate.get_or_insert_with(|| A::blank(id, envelope.isolation.clone()));
            let event: A::Event = envelope.decode()?;
            current.replay(&event, envelope.version);
            replayed += 1;
        }

        Ok((aggregate, replayed))
    }

    /// Appends the aggregate's uncommitted events.
    pub async fn save(&self, aggregate: &mut A) -> Result<SaveOutcome, DomainError> {
        self.save_with_metadata(aggregate, HashMap::new()).await
    }

    /// Appends the aggregate's uncommitted events, attaching `metadata`
    /// (correlation and causation ids) to each of them.
    ///
    /// On a conflict nothing is written, the aggregate keeps its pending
    /// events, and the caller must reload before trying again. Creating an
    /// aggregate whose id is taken fails with `AlreadyExists`, which is not
    /// retriable.
    #[tracing::instrument(
        skip(self, aggregate, metadata),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate.id())
    )]
    pub async fn save_with_metadata(
        &self,
        aggregate: &mut A,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<SaveOutcome, DomainError> {
        let expected = aggregate.version();
        if aggregate.uncommitted_events().is_empty() {
            return Ok(SaveOutcome {
                version: expected,
                committed: Vec::new(),
                delivery: DeliveryHandle::empty(),
            });
        }

        let occurred_at = self.clock.now();
        let mut batch = Vec::with_capacity(aggregate.uncommitted_events().len());
        for event in aggregate.uncommitted_events() {
            batch.push(
                NewEvent::builder()
                    .event_type(event.event_type())
                    .aggregate_type(A::aggregate_type())
                    .occurred_at(occurred_at)
                    .isolation(aggregate.isolation().clone())
                    .payload(event)?
                    .metadata_map(metadata.clone())
                    .build()?,
            );
        }

        let committed = match self.store.append(aggregate.id(), expected, batch).await {
            Ok(committed) => committed,
            // A create that finds an existing stream must not reveal its version.
            Err(error) if error.is_conflict() && expected == Version::initial() => {
                tracing::warn!(aggregate_id = %aggregate.id(), "create found an existing aggregate");
                return Err(DomainError::AlreadyExists {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id: aggregate.id(),
                });
            }
            Err(error) if error.is_conflict() => {
                metrics::counter!("repository_conflicts_total", "aggregate_type" => A::aggregate_type())
                    .increment(1);
                tracing::warn!(%error, "save lost an optimistic-concurrency race");
                return Err(error.into());
            }
            Err(error) => return Err(error.into()),
        };

        let version = committed.last().map_or(expected, |event| event.version);
        aggregate.meta_mut().mark_committed(version);
        metrics::counter!("repository_saves_total", "aggregate_type" => A::aggregate_type())
            .increment(1);
        tracing::debug!(%version, events = committed.len(), "aggregate saved");

        if let Some(snapshots) = &self.snapshots
            && crosses_snapshot_boundary(expected, version, snapshots.interval)
        {
            self.take_snapshot(snapshots, aggregate).await;
        }

        let delivery = match &self.bus {
            Some(bus) => bus.publish(committed.clone()),
            None => DeliveryHandle::empty(),
        };

        Ok(SaveOutcome {
            version,
            committed,
            delivery,
        })
    }

    async fn restore_snapshot(&self, id: AggregateId) -> Option<A> {
        let snapshots = self.snapshots.as_ref()?;
        let snapshot = match snapshots.store.load(id).await {
            Ok(snapshot) => snapshot?,
            Err(error) => {
                tracing::warn!(%error, aggregate_id = %id, "snapshot load failed, replaying full stream");
                return None;
            }
        };

        let version = snapshot.version;
        match (snapshots.decode)(snapshot.state) {
            Ok(mut aggregate) => {
                aggregate.meta_mut().mark_committed(version);
                Some(aggregate)
            }
            Err(error) => {
                tracing::warn!(%error, aggregate_id = %id, "snapshot unreadable, replaying full stream");
                None
            }
        }
    }

    async fn take_snapshot(&self, snapshots: &Snapshotting<A>, aggregate: &A) {
        let state = match (snapshots.encode)(aggregate) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(%error, "snapshot serialization failed");
                return;
            }
        };

        let snapshot = Snapshot {
            aggregate_id: aggregate.id(),
            aggregate_type: A::aggregate_type().to_string(),
            version: aggregate.version(),
            taken_at: self.clock.now(),
            state,
        };
        match snapshots.store.save(snapshot).await {
            Ok(()) => {
                metrics::counter!("snapshots_saved_total", "aggregate_type" => A::aggregate_type())
                    .increment(1);
            }
            Err(error) => tracing::warn!(%error, "snapshot save failed"),
        }
    }
}

fn authorize<A: Aggregate>(
    id: AggregateId,
    scope: &IsolationContext,
    required: &IsolationContext,
) -> Result<(), DomainError> {
    if required.contains(scope) {
        return Ok(());
    }
    tracing::warn!(
        aggregate_id = %id,
        %scope,
        %required,
        "isolation context does not contain the aggregate's scope"
    );
    Err(DomainError::UnauthorizedAccess {
        aggregate_type: A::aggregate_type(),
        aggregate_id: id,
    })
}

fn not_found<A: Aggregate>(id: AggregateId) -> DomainError {
    DomainError::NotFound {
        aggregate_type: A::aggregate_type(),
        aggregate_id: id,
    }
}
