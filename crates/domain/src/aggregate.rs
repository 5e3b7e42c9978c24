//! Core aggregate and domain event traits.

use common::{AggregateId, IsolationContext};
use event_store::Version;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Returns the event type name stored alongside the payload.
    fn event_type(&self) -> &'static str;
}

/// Bookkeeping every aggregate root carries.
///
/// `version` is the last persisted version, 0 for an aggregate that was
/// never saved. Events recorded since then wait in `uncommitted` until the
/// repository appends them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AggregateMeta<E> {
    id: AggregateId,
    version: Version,
    isolation: IsolationContext,
    #[serde(default)]
    deleted: bool,
    #[serde(skip)]
    uncommitted: Vec<E>,
}

impl<E> AggregateMeta<E> {
    pub fn new(id: AggregateId, isolation: IsolationContext) -> Self {
        Self {
            id,
            version: Version::initial(),
            isolation,
            deleted: false,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Scope recorded when the aggregate was created.
    pub fn isolation(&self) -> &IsolationContext {
        &self.isolation
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn uncommitted(&self) -> &[E] {
        &self.uncommitted
    }

    /// Version the aggregate will have once the pending events are stored.
    pub fn pending_version(&self) -> Version {
        self.version.advance(self.uncommitted.len())
    }

    pub(crate) fn mark_committed(&mut self, version: Version) {
        self.version = version;
        self.uncommitted.clear();
    }
}

impl<E> Default for AggregateMeta<E> {
    fn default() -> Self {
        Self::new(AggregateId::default(), IsolationContext::platform())
    }
}

/// Trait for event-sourced aggregate roots.
///
/// State changes only through [`Aggregate::apply`]. Command methods check
/// their invariants and then [`Aggregate::record`] events, which applies
/// them and queues them for the repository.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    ///
    /// Used for event store organization and routing.
    fn aggregate_type() -> &'static str;

    fn meta(&self) -> &AggregateMeta<Self::Event>;

    fn meta_mut(&mut self) -> &mut AggregateMeta<Self::Event>;

    /// Folds one event into the state.
    ///
    /// Must be deterministic and must not fail: events are facts that have
    /// already happened.
    fn apply(&mut self, event: &Self::Event);

    /// True for the event that soft-deletes the aggregate.
    fn is_deletion(_event: &Self::Event) -> bool {
        false
    }

    /// An empty aggregate with the given identity, ready to fold history into.
    fn blank(id: AggregateId, isolation: IsolationContext) -> Self {
        let mut aggregate = Self::default();
        *aggregate.meta_mut() = AggregateMeta::new(id, isolation);
        aggregate
    }

    fn id(&self) -> AggregateId {
        self.meta().id()
    }

    fn version(&self) -> Version {
        self.meta().version()
    }

    fn isolation(&self) -> &IsolationContext {
        self.meta().isolation()
    }

    fn is_deleted(&self) -> bool {
        self.meta().is_deleted()
    }

    fn uncommitted_events(&self) -> &[Self::Event] {
        self.meta().uncommitted()
    }

    /// Applies a new event and queues it for the next save.
    fn record(&mut self, event: Self::Event) {
        fold(self, &event);
        self.meta_mut().uncommitted.push(event);
    }

    /// Applies a stored event read back at `version`.
    fn replay(&mut self, event: &Self::Event, version: Version) {
        fold(self, event);
        self.meta_mut().version = version;
    }
}

fn fold<A: Aggregate>(aggregate: &mut A, event: &A::Event) {
    aggregate.apply(event);
    if A::is_deletion(event) {
        aggregate.meta_mut().deleted = true;
    }
}

/// Trait for aggregates that support snapshotting.
///
/// Snapshotting is an optimization to avoid replaying all events when loading
/// an aggregate. The aggregate state is periodically serialized and stored.
pub trait SnapshotCapable: Aggregate + Serialize + DeserializeOwned {
    /// Number of events between snapshots.
    fn snapshot_interval() -> u64 {
        100
    }
}

/// True when a save moving the aggregate from `before` to `after` passes a
/// multiple of `interval`.
pub fn crosses_snapshot_boundary(before: Version, after: Version, interval: u64) -> bool {
    let interval = interval.max(1) as i64;
    after.as_i64() > 0 && before.as_i64() / interval < after.as_i64() / interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum CounterEvent {
        Opened,
        Incremented { by: i32 },
        Closed,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Opened => "CounterOpened",
                CounterEvent::Incremented { .. } => "CounterIncremented",
                CounterEvent::Closed => "CounterClosed",
            }
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Counter {
        meta: AggregateMeta<CounterEvent>,
        value: i32,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn meta(&self) -> &AggregateMeta<CounterEvent> {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut AggregateMeta<CounterEvent> {
            &mut self.meta
        }

        fn apply(&mut self, event: &CounterEvent) {
            if let CounterEvent::Incremented { by } = event {
                self.value += by;
            }
        }

        fn is_deletion(event: &CounterEvent) -> bool {
            matches!(event, CounterEvent::Closed)
        }
    }

    fn tenant() -> IsolationContext {
        IsolationContext::tenant("acme").unwrap()
    }

    #[test]
    fn record_applies_and_queues() {
        let mut counter = Counter::blank(AggregateId::new(), tenant());
        counter.record(CounterEvent::Opened);
        counter.record(CounterEvent::Incremented { by: 5 });

        assert_eq!(counter.value, 5);
        assert_eq!(counter.version(), Version::initial());
        assert_eq!(counter.uncommitted_events().len(), 2);
        assert_eq!(counter.meta().pending_version(), Version::new(2));
    }

    #[test]
    fn replay_tracks_version_without_queueing() {
        let mut counter = Counter::blank(AggregateId::new(), tenant());
        counter.replay(&CounterEvent::Opened, Version::new(1));
        counter.replay(&CounterEvent::Incremented { by: 2 }, Version::new(2));

        assert_eq!(counter.version(), Version::new(2));
        assert!(counter.uncommitted_events().is_empty());
    }

    #[test]
    fn deletion_event_sets_flag() {
        let mut counter = Counter::blank(AggregateId::new(), tenant());
        counter.record(CounterEvent::Opened);
        assert!(!counter.is_deleted());

        counter.record(CounterEvent::Closed);
        assert!(counter.is_deleted());
    }

    #[test]
    fn uncommitted_events_are_not_serialized() {
        let mut counter = Counter::blank(AggregateId::new(), tenant());
        counter.record(CounterEvent::Incremented { by: 1 });

        let restored: Counter =
            serde_json::from_value(serde_json::to_value(&counter).unwrap()).unwrap();

        assert_eq!(restored.value, 1);
        assert_eq!(restored.isolation(), &tenant());
        assert!(restored.uncommitted_events().is_empty());
    }

    #[test]
    fn snapshot_boundary() {
        assert!(!crosses_snapshot_boundary(Version::new(0), Version::new(99), 100));
        assert!(crosses_snapshot_boundary(Version::new(99), Version::new(100), 100));
        assert!(crosses_snapshot_boundary(Version::new(98), Version::new(103), 100));
        assert!(!crosses_snapshot_boundary(Version::new(100), Version::new(101), 100));
        assert!(crosses_snapshot_boundary(Version::new(0), Version::new(1), 1));
    }
}
