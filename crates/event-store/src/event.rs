use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError, IsolationContext};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// `0` means "no events yet". The first event of an aggregate is version 1
/// and every further event adds exactly one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a new aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the version `count` events after this one.
    pub fn advance(&self, count: usize) -> Self {
        Self(self.0 + count as i64)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Identity of a committed event: the aggregate it belongs to and its version.
///
/// Redelivery of an event is detected by this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub aggregate_id: AggregateId,
    pub version: Version,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.aggregate_id, self.version)
    }
}

/// An event that has not been appended yet.
///
/// The store assigns the version and position when the event is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub occurred_at: DateTime<Utc>,
    pub isolation: IsolationContext,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewEvent {
    /// Creates a new event builder.
    pub fn builder() -> NewEventBuilder {
        NewEventBuilder::default()
    }

    /// Turns this event into a committed envelope.
    pub(crate) fn commit(
        self,
        aggregate_id: AggregateId,
        version: Version,
        position: i64,
    ) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            position,
            aggregate_id,
            aggregate_type: self.aggregate_type,
            version,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            isolation: self.isolation,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// Builder for [`NewEvent`].
#[derive(Debug, Default)]
pub struct NewEventBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_type: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    isolation: Option<IsolationContext>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl NewEventBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn isolation(mut self, isolation: IsolationContext) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Merges a metadata map into the event's metadata.
    pub fn metadata_map(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Builds the event, failing on the first missing required field.
    ///
    /// `occurred_at` has no default: timestamps come from the caller's clock.
    pub fn build(self) -> Result<NewEvent, EventStoreError> {
        Ok(NewEvent {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self
                .event_type
                .ok_or(EventStoreError::MissingField("event_type"))?,
            aggregate_type: self
                .aggregate_type
                .ok_or(EventStoreError::MissingField("aggregate_type"))?,
            occurred_at: self
                .occurred_at
                .ok_or(EventStoreError::MissingField("occurred_at"))?,
            isolation: self
                .isolation
                .ok_or(EventStoreError::MissingField("isolation"))?,
            payload: self.payload.ok_or(EventStoreError::MissingField("payload"))?,
            metadata: self.metadata,
        })
    }
}

/// A committed event as stored and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// Store-wide position, strictly increasing in commit order.
    pub position: i64,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Order", "Saga").
    pub aggregate_type: String,

    /// The version of the aggregate after this event.
    pub version: Version,

    /// The type of the event (e.g., "OrderPlaced").
    pub event_type: String,

    pub occurred_at: DateTime<Utc>,

    /// Scope the event was emitted in.
    pub isolation: IsolationContext,

    pub payload: serde_json::Value,

    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Returns the `(aggregate id, version)` identity of this event.
    pub fn key(&self) -> EventKey {
        EventKey {
            aggregate_id: self.aggregate_id,
            version: self.version,
        }
    }

    /// Deserializes the payload into a concrete event type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Looks up a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> IsolationContext {
        IsolationContext::tenant("acme").unwrap()
    }

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(Version::initial().advance(3), Version::new(3));
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn builder_requires_occurred_at() {
        let result = NewEvent::builder()
            .event_type("OrderPlaced")
            .aggregate_type("Order")
            .isolation(tenant())
            .payload_raw(serde_json::json!({}))
            .build();

        assert!(matches!(
            result,
            Err(EventStoreError::MissingField("occurred_at"))
        ));
    }

    #[test]
    fn commit_assigns_identity() {
        let aggregate_id = AggregateId::new();
        let new = NewEvent::builder()
            .event_type("OrderPlaced")
            .aggregate_type("Order")
            .occurred_at(Utc::now())
            .isolation(tenant())
            .payload_raw(serde_json::json!({"customer": "c-1"}))
            .metadata("correlation_id", serde_json::json!("123"))
            .build()
            .unwrap();

        let envelope = new.commit(aggregate_id, Version::first(), 7);

        assert_eq!(envelope.position, 7);
        assert_eq!(
            envelope.key(),
            EventKey {
                aggregate_id,
                version: Version::first()
            }
        );
        assert_eq!(envelope.metadata_str("correlation_id"), Some("123"));
    }

    #[test]
    fn envelope_json_preserves_identity_tuple() {
        let envelope = NewEvent::builder()
            .event_type("OrderPlaced")
            .aggregate_type("Order")
            .occurred_at(Utc::now())
            .isolation(IsolationContext::department("acme", "emea", "sales").unwrap())
            .payload_raw(serde_json::json!({"lines": [1, 2]}))
            .build()
            .unwrap()
            .commit(AggregateId::new(), Version::new(4), 11);

        let json = serde_json::to_string(&envelope).unwrap();
        let restored: EventEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, envelope);
    }
}
