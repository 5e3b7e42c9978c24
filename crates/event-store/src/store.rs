use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, NewEvent, Result, Version,
};

/// A lazy stream of committed events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Append-only persistence for events.
///
/// Implementations must make the compare-and-append in [`EventStore::append`]
/// atomic per aggregate: two concurrent appends with the same expected version
/// cannot both succeed. A `read_stream` started after an `append` returned
/// observes that append's events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to one aggregate.
    ///
    /// Fails with `ConcurrencyConflict` unless the aggregate's highest stored
    /// version equals `expected_version`; in that case nothing is appended.
    /// Otherwise the events receive versions `expected_version + 1 ..` in
    /// order and the committed envelopes are returned.
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>>;

    /// Streams an aggregate's events with version `>= from_version`, in
    /// ascending version order.
    ///
    /// The store keeps no cursor for the reader; a caller may request again
    /// from any version.
    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<EventStream>;

    /// Gets the current version of an aggregate, or None if it has no events.
    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Retrieves events matching a query, in position order.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Streams every event with a position greater than `after_position`, in
    /// position order. Pass 0 to read the whole log.
    async fn stream_all_events(&self, after_position: i64) -> Result<EventStream>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Reads an aggregate's full history into memory.
    async fn read_all(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        self.read_stream(aggregate_id, Version::first())
            .await?
            .try_collect()
            .await
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.current_version(aggregate_id).await?.is_some())
    }

    /// Retrieves every event of one type.
    async fn events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        self.query_events(EventQuery::for_event_type(event_type))
            .await
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a batch before it is appended.
pub(crate) fn validate_batch(events: &[NewEvent]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    for event in events {
        if event.event_type.is_empty() {
            return Err(EventStoreError::InvalidAppend(
                "event type must not be empty".to_string(),
            ));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidAppend(format!(
                "mixed aggregate types in one batch: {} and {}",
                first.aggregate_type, event.aggregate_type
            )));
        }
    }

    Ok(())
}
