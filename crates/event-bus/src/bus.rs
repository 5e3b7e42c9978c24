//! Fan-out of committed events to subscribers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use event_store::{EventEnvelope, EventKey};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::{
    EventBusError, EventHandler, EventHandlerError, InMemoryLedger, ProcessedEventLedger, Result,
    RetryPolicy,
};

struct Subscription {
    handler: Arc<dyn EventHandler>,
    /// None subscribes to every event type.
    event_types: Option<HashSet<String>>,
    policy: RetryPolicy,
    /// Completion signal of the last batch queued for this handler.
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Subscription {
    fn accepts(&self, event: &EventEnvelope) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|types| types.contains(&event.event_type))
    }
}

/// Builder for [`EventBus`]. Registration happens once, before publishing.
pub struct EventBusBuilder {
    subscriptions: Vec<(Arc<dyn EventHandler>, Option<HashSet<String>>)>,
    ledger: Option<Arc<dyn ProcessedEventLedger>>,
    default_policy: RetryPolicy,
}

impl EventBusBuilder {
    fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            ledger: None,
            default_policy: RetryPolicy::once(),
        }
    }

    /// Subscribes a handler to the given event types.
    pub fn subscribe<I, S>(mut self, event_types: I, handler: Arc<dyn EventHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types = event_types.into_iter().map(Into::into).collect();
        self.subscriptions.push((handler, Some(types)));
        self
    }

    /// Subscribes a handler to every event.
    pub fn subscribe_all(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.subscriptions.push((handler, None));
        self
    }

    /// Uses `ledger` instead of a default-sized [`InMemoryLedger`].
    pub fn with_ledger(mut self, ledger: Arc<dyn ProcessedEventLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Policy for handlers that do not set their own.
    pub fn default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Builds the bus, rejecting two subscribers with the same name.
    pub fn build(self) -> Result<EventBus> {
        let mut names = HashSet::new();
        let mut subscriptions = Vec::with_capacity(self.subscriptions.len());

        for (handler, event_types) in self.subscriptions {
            if !names.insert(handler.name()) {
                return Err(EventBusError::DuplicateSubscriber(handler.name().to_string()));
            }
            let policy = handler.retry_policy().unwrap_or(self.default_policy);
            subscriptions.push(Subscription {
                handler,
                event_types,
                policy,
                tail: Mutex::new(None),
            });
        }

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::default()));

        Ok(EventBus {
            inner: Arc::new(Inner {
                subscriptions,
                ledger,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }
}

struct Inner {
    subscriptions: Vec<Subscription>,
    ledger: Arc<dyn ProcessedEventLedger>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a delivery task ends, panicking or not.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn start(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Asynchronous publisher of committed events.
///
/// Every matching subscriber gets the batch on its own task, so a slow or
/// failing handler never holds up the others or the publisher. Batches reach
/// one subscriber in the order they were published. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// A bus with no subscribers.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Vec::new(),
                ledger: Arc::new(InMemoryLedger::new(1)),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Names of the registered subscribers, in registration order.
    pub fn subscribers(&self) -> Vec<&'static str> {
        self.inner
            .subscriptions
            .iter()
            .map(|s| s.handler.name())
            .collect()
    }

    /// Number of delivery tasks still running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Hands committed events to every subscriber of their types.
    ///
    /// Returns immediately; delivery continues even if the handle is dropped.
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    pub fn publish(&self, events: Vec<EventEnvelope>) -> DeliveryHandle {
        let events = Arc::new(events);
        let mut tasks = Vec::new();

        for (index, subscription) in self.inner.subscriptions.iter().enumerate() {
            if !events.iter().any(|event| subscription.accepts(event)) {
                continue;
            }

            let (done, finished) = oneshot::channel();
            let previous = subscription
                .tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(finished);

            let guard = InFlight::start(&self.inner);
            let inner = Arc::clone(&self.inner);
            let events = Arc::clone(&events);
            let task = tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let report = deliver(&inner.subscriptions[index], &*inner.ledger, &events).await;
                drop(done);
                drop(guard);
                report
            });
            tasks.push((subscription.handler.name(), task));
        }

        DeliveryHandle { tasks }
    }

    /// Waits until no delivery task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn deliver(
    subscription: &Subscription,
    ledger: &dyn ProcessedEventLedger,
    events: &[EventEnvelope],
) -> DeliveryReport {
    let name = subscription.handler.name();
    let mut report = DeliveryReport::new(name);

    for event in events.iter().filter(|event| subscription.accepts(event)) {
        let key = event.key();

        if !ledger.try_claim(name, key).await {
            tracing::debug!(handler = name, %key, "duplicate delivery skipped");
            metrics::counter!("event_bus_duplicates_skipped_total", "handler" => name).increment(1);
            report.duplicates += 1;
            continue;
        }

        match handle_with_retry(subscription, event).await {
            Ok(()) => {
                ledger.mark_processed(name, key).await;
                metrics::counter!("event_bus_deliveries_total", "handler" => name).increment(1);
                report.delivered += 1;
            }
            Err(error) => {
                ledger.release(name, key).await;
                tracing::error!(
                    handler = name,
                    %key,
                    event_type = %event.event_type,
                    error = %error,
                    "event handler failed"
                );
                metrics::counter!("event_bus_delivery_failures_total", "handler" => name)
                    .increment(1);
                report.failures.push(FailedDelivery {
                    key,
                    event_type: event.event_type.clone(),
                    error: error.to_string(),
                });
            }
        }
    }

    report
}

async fn handle_with_retry(
    subscription: &Subscription,
    event: &EventEnvelope,
) -> std::result::Result<(), EventHandlerError> {
    let policy = subscription.policy;
    let mut attempt = 1;

    loop {
        match subscription.handler.handle(event).await {
            Ok(()) => return Ok(()),
            Err(error) if error.is_retriable() && attempt < policy.max_attempts => {
                tracing::warn!(
                    handler = subscription.handler.name(),
                    key = %event.key(),
                    attempt,
                    error = %error,
                    "event handler failed, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// One failed delivery in a [`DeliveryReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub key: EventKey,
    pub event_type: String,
    pub error: String,
}

/// Outcome of delivering one published batch to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub handler: &'static str,
    pub delivered: usize,
    pub duplicates: usize,
    pub failures: Vec<FailedDelivery>,
    /// Set when the delivery task panicked or was cancelled.
    pub aborted: Option<String>,
}

impl DeliveryReport {
    fn new(handler: &'static str) -> Self {
        Self {
            handler,
            delivered: 0,
            duplicates: 0,
            failures: Vec::new(),
            aborted: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

/// Handle on the delivery tasks of one `publish` call.
///
/// Dropping it detaches the tasks; they still run to completion.
#[derive(Debug)]
#[must_use = "dropping the handle detaches delivery; call `wait` to observe outcomes"]
pub struct DeliveryHandle {
    tasks: Vec<(&'static str, JoinHandle<DeliveryReport>)>,
}

impl DeliveryHandle {
    /// A handle with nothing to wait for.
    pub fn empty() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Number of subscribers the batch was handed to.
    pub fn subscriber_count(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every subscriber and returns one report each.
    pub async fn wait(self) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for (handler, task) in self.tasks {
            let report = match task.await {
                Ok(report) => report,
                Err(join_error) => {
                    tracing::error!(handler, error = %join_error, "delivery task aborted");
                    let mut report = DeliveryReport::new(handler);
                    report.aborted = Some(join_error.to_string());
                    report
                }
            };
            reports.push(report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use common::{AggregateId, IsolationContext};
    use event_store::{EventStore, InMemoryEventStore, NewEvent, Version};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    /// Records every event it sees; fails the first `fail_first` attempts.
    struct Recorder {
        name: &'static str,
        seen: AsyncMutex<Vec<EventKey>>,
        attempts: AtomicU32,
        fail_first: u32,
        policy: Option<RetryPolicy>,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Self::failing(name, 0, None)
        }

        fn failing(name: &'static str, fail_first: u32, policy: Option<RetryPolicy>) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: AsyncMutex::new(Vec::new()),
                attempts: AtomicU32::new(0),
                fail_first,
                policy,
            })
        }

        async fn seen(&self) -> Vec<EventKey> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), EventHandlerError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(EventHandlerError::Failed(format!("attempt {attempt}")));
            }
            self.seen.lock().await.push(event.key());
            Ok(())
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            self.policy
        }
    }

    async fn committed(event_types: &[&str]) -> Vec<EventEnvelope> {
        let store = InMemoryEventStore::new();
        let events = event_types
            .iter()
            .map(|event_type| {
                NewEvent::builder()
                    .aggregate_type("Order")
                    .event_type(*event_type)
                    .occurred_at(Utc::now())
                    .isolation(IsolationContext::tenant("acme").unwrap())
                    .payload_raw(serde_json::json!({}))
                    .build()
                    .unwrap()
            })
            .collect();
        store
            .append(AggregateId::new(), Version::initial(), events)
            .await
            .unwrap()
    }

    #[test]
    fn duplicate_subscriber_names_are_rejected() {
        let result = EventBus::builder()
            .subscribe(["OrderPlaced"], Recorder::new("audit"))
            .subscribe_all(Recorder::new("audit"))
            .build();

        assert!(matches!(
            result,
            Err(EventBusError::DuplicateSubscriber(name)) if name == "audit"
        ));
    }

    #[tokio::test]
    async fn routes_by_event_type() {
        let placed = Recorder::new("placed");
        let everything = Recorder::new("everything");
        let bus = EventBus::builder()
            .subscribe(["OrderPlaced"], placed.clone())
            .subscribe_all(everything.clone())
            .build()
            .unwrap();

        let events = committed(&["OrderPlaced", "OrderSubmitted"]).await;
        let reports = bus.publish(events.clone()).wait().await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(DeliveryReport::is_success));
        assert_eq!(placed.seen().await, vec![events[0].key()]);
        assert_eq!(everything.seen().await.len(), 2);
    }

    #[tokio::test]
    async fn redelivery_is_deduplicated() {
        let audit = Recorder::new("audit");
        let bus = EventBus::builder()
            .subscribe_all(audit.clone())
            .build()
            .unwrap();

        let events = committed(&["OrderPlaced"]).await;
        bus.publish(events.clone()).wait().await;
        let reports = bus.publish(events).wait().await;

        assert_eq!(reports[0].duplicates, 1);
        assert_eq!(reports[0].delivered, 0);
        assert_eq!(audit.seen().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let broken = Recorder::failing("broken", u32::MAX, None);
        let healthy = Recorder::new("healthy");
        let bus = EventBus::builder()
            .subscribe_all(broken.clone())
            .subscribe_all(healthy.clone())
            .build()
            .unwrap();

        let events = committed(&["OrderPlaced"]).await;
        let reports = bus.publish(events).wait().await;

        let broken_report = reports.iter().find(|r| r.handler == "broken").unwrap();
        assert_eq!(broken_report.failures.len(), 1);
        assert_eq!(healthy.seen().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_released_for_redelivery() {
        let flaky = Recorder::failing("flaky", 1, None);
        let bus = EventBus::builder()
            .subscribe_all(flaky.clone())
            .build()
            .unwrap();

        let events = committed(&["OrderPlaced"]).await;
        let first = bus.publish(events.clone()).wait().await;
        assert!(!first[0].is_success());

        let second = bus.publish(events).wait().await;
        assert_eq!(second[0].delivered, 1);
        assert_eq!(flaky.seen().await.len(), 1);
    }

    #[tokio::test]
    async fn retry_policy_retries_transient_failures() {
        let flaky = Recorder::failing(
            "flaky",
            2,
            Some(RetryPolicy::attempts(3, Duration::from_millis(1))),
        );
        let bus = EventBus::builder()
            .subscribe_all(flaky.clone())
            .build()
            .unwrap();

        let reports = bus.publish(committed(&["OrderPlaced"]).await).wait().await;

        assert!(reports[0].is_success());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn batches_reach_a_subscriber_in_publish_order() {
        let audit = Recorder::new("audit");
        let bus = EventBus::builder()
            .subscribe_all(audit.clone())
            .build()
            .unwrap();

        let events = committed(&["A", "B", "C", "D"]).await;
        for event in &events {
            let _ = bus.publish(vec![event.clone()]);
        }
        bus.wait_idle().await;

        let expected: Vec<EventKey> = events.iter().map(EventEnvelope::key).collect();
        assert_eq!(audit.seen().await, expected);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::empty();
        let handle = bus.publish(committed(&["OrderPlaced"]).await);
        assert_eq!(handle.subscriber_count(), 0);
        assert!(handle.wait().await.is_empty());
        bus.wait_idle().await;
    }
}
