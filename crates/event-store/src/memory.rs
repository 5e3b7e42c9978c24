use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, NewEvent, Result, Snapshot,
    SnapshotStore, Version,
    store::{EventStore, EventStream, validate_batch},
};

#[derive(Default)]
struct Log {
    /// Every committed event; index `i` holds position `i + 1`.
    events: Vec<EventEnvelope>,
    /// Per-aggregate indexes into `events`, in version order.
    streams: HashMap<AggregateId, Vec<usize>>,
}

impl Log {
    fn current_version(&self, aggregate_id: AggregateId) -> Version {
        self.streams
            .get(&aggregate_id)
            .map(|stream| Version::initial().advance(stream.len()))
            .unwrap_or_default()
    }
}

/// In-memory event store.
///
/// A single write lock covers compare-and-append, so concurrent appends to the
/// same aggregate are serialized. Clones share the same log.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        let mut log = self.log.write().await;
        log.events.clear();
        log.streams.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>> {
        validate_batch(&events)?;

        let mut log = self.log.write().await;

        let actual = log.current_version(aggregate_id);
        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut version = expected_version;
        for event in events {
            version = version.next();
            let index = log.events.len();
            let envelope = event.commit(aggregate_id, version, index as i64 + 1);
            log.events.push(envelope.clone());
            log.streams.entry(aggregate_id).or_default().push(index);
            committed.push(envelope);
        }

        metrics::counter!("event_store_events_appended_total", "store" => "memory")
            .increment(committed.len() as u64);
        tracing::debug!(%aggregate_id, %version, "events appended");
        Ok(committed)
    }

    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<EventStream> {
        let log = self.log.read().await;
        let events: Vec<EventEnvelope> = log
            .streams
            .get(&aggregate_id)
            .into_iter()
            .flatten()
            .map(|&index| &log.events[index])
            .filter(|event| event.version >= from_version)
            .cloned()
            .collect();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let log = self.log.read().await;
        Ok(log
            .streams
            .contains_key(&aggregate_id)
            .then(|| log.current_version(aggregate_id)))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let matching = log
            .events
            .iter()
            .filter(|event| query.matches(event))
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn stream_all_events(&self, after_position: i64) -> Result<EventStream> {
        let log = self.log.read().await;
        let start = usize::try_from(after_position.max(0)).unwrap_or(usize::MAX);
        let events: Vec<EventEnvelope> = log.events.iter().skip(start).cloned().collect();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

/// In-memory snapshot store keeping the newest snapshot per aggregate.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<AggregateId, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of aggregates with a snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get(&snapshot.aggregate_id) {
            Some(existing) if existing.version >= snapshot.version => {}
            _ => {
                snapshots.insert(snapshot.aggregate_id, snapshot);
            }
        }
        Ok(())
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().await.get(&aggregate_id).cloned())
    }
}
