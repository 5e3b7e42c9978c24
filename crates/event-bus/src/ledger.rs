//! Processed-event ledger.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use event_store::EventKey;
use lru::LruCache;
use tokio::sync::Mutex;

/// Entries retained by [`InMemoryLedger::default`].
pub const DEFAULT_LEDGER_CAPACITY: usize = 100_000;

/// Records which events each handler has already processed.
///
/// Keys are `(handler name, aggregate id, version)`.
#[async_trait]
pub trait ProcessedEventLedger: Send + Sync {
    /// Claims a delivery. Returns false if the handler already processed the
    /// event or another delivery of it is in flight.
    async fn try_claim(&self, handler: &str, key: EventKey) -> bool;

    /// Records a claimed delivery as done.
    async fn mark_processed(&self, handler: &str, key: EventKey);

    /// Drops a claim after a failed delivery so a later redelivery can retry.
    async fn release(&self, handler: &str, key: EventKey);

    async fn is_processed(&self, handler: &str, key: EventKey) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    InFlight,
    Processed,
}

/// Bounded in-memory ledger evicting the least recently used entries.
///
/// An evicted entry is forgotten: a redelivery older than the last
/// `capacity` deliveries is handled again.
pub struct InMemoryLedger {
    entries: Mutex<LruCache<(String, EventKey), Entry>>,
}

impl InMemoryLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[async_trait]
impl ProcessedEventLedger for InMemoryLedger {
    async fn try_claim(&self, handler: &str, key: EventKey) -> bool {
        let mut entries = self.entries.lock().await;
        let slot = (handler.to_string(), key);
        if entries.get(&slot).is_some() {
            return false;
        }
        entries.put(slot, Entry::InFlight);
        true
    }

    async fn mark_processed(&self, handler: &str, key: EventKey) {
        self.entries
            .lock()
            .await
            .put((handler.to_string(), key), Entry::Processed);
    }

    async fn release(&self, handler: &str, key: EventKey) {
        let mut entries = self.entries.lock().await;
        let slot = (handler.to_string(), key);
        if entries.peek(&slot) == Some(&Entry::InFlight) {
            entries.pop(&slot);
        }
    }

    async fn is_processed(&self, handler: &str, key: EventKey) -> bool {
        self.entries.lock().await.peek(&(handler.to_string(), key)) == Some(&Entry::Processed)
    }
}

#[cfg(test)]
mod tests {
    use common::AggregateId;
    use event_store::Version;

    use super::*;

    fn key(aggregate_id: AggregateId, version: i64) -> EventKey {
        EventKey {
            aggregate_id,
            version: Version::new(version),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let ledger = InMemoryLedger::default();
        let id = AggregateId::new();

        assert!(ledger.try_claim("audit", key(id, 1)).await);
        assert!(!ledger.try_claim("audit", key(id, 1)).await);
        assert!(ledger.try_claim("mailer", key(id, 1)).await);

        ledger.release("audit", key(id, 1)).await;
        assert!(ledger.try_claim("audit", key(id, 1)).await);
    }

    #[tokio::test]
    async fn processed_entries_survive_release() {
        let ledger = InMemoryLedger::default();
        let id = AggregateId::new();

        assert!(ledger.try_claim("audit", key(id, 1)).await);
        ledger.mark_processed("audit", key(id, 1)).await;
        ledger.release("audit", key(id, 1)).await;

        assert!(ledger.is_processed("audit", key(id, 1)).await);
        assert!(!ledger.try_claim("audit", key(id, 1)).await);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let ledger = InMemoryLedger::new(2);
        let id = AggregateId::new();

        for version in 1..=3 {
            assert!(ledger.try_claim("audit", key(id, version)).await);
            ledger.mark_processed("audit", key(id, version)).await;
        }

        assert_eq!(ledger.len().await, 2);
        assert!(!ledger.is_processed("audit", key(id, 1)).await);
        assert!(ledger.is_processed("audit", key(id, 3)).await);
    }
}
