//! Catch-up: re-publishing the committed log through the bus.

use event_store::EventStore;
use futures_util::StreamExt;

use crate::{EventBus, Result};

/// Totals from a [`catch_up`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Events read from the store.
    pub events: usize,
    pub delivered: usize,
    /// Deliveries the ledger had already recorded.
    pub duplicates: usize,
    pub failures: usize,
    /// Position of the last event read; pass it back to resume.
    pub last_position: i64,
}

/// Re-publishes every event after `after_position`, in position order, in
/// batches of `batch_size`, waiting for each batch before reading the next.
///
/// Subscribers that already processed an event skip it through the ledger,
/// so running catch-up over an up-to-date bus has no side effects.
#[tracing::instrument(skip(bus, store))]
pub async fn catch_up(
    bus: &EventBus,
    store: &dyn EventStore,
    after_position: i64,
    batch_size: usize,
) -> Result<CatchUpReport> {
    let batch_size = batch_size.max(1);
    let mut stream = store.stream_all_events(after_position).await?;
    let mut report = CatchUpReport {
        last_position: after_position,
        ..Default::default()
    };
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let next = stream.next().await.transpose()?;
        let done = next.is_none();
        if let Some(event) = next {
            report.last_position = event.position;
            batch.push(event);
        }

        if batch.len() >= batch_size || (done && !batch.is_empty()) {
            report.events += batch.len();
            for delivery in bus.publish(std::mem::take(&mut batch)).wait().await {
                report.delivered += delivery.delivered;
                report.duplicates += delivery.duplicates;
                report.failures += delivery.failures.len();
            }
        }

        if done {
            break;
        }
    }

    tracing::info!(
        events = report.events,
        delivered = report.delivered,
        duplicates = report.duplicates,
        failures = report.failures,
        "catch-up complete"
    );
    Ok(report)
}
