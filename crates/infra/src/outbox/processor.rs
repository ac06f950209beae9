//! Outbox drain loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use astra_events::{AdapterRegistry, BusError, EventBus, StreamStore};

use super::{OutboxError, OutboxRecord, OutboxStore};

/// Why a row could not be published.
enum PublishFailure {
    /// The row itself is bad (or the bus rejected it for good): mark FAILED.
    Permanent(String),
    /// The bus is unreachable: leave the row PENDING for the next cycle.
    Transient(BusError),
}

/// Moves PENDING outbox rows onto the event bus.
///
/// Holds no locks of its own; every status change is a conditional update in the store,
/// so several processors may drain the same table (each row still publishes at least
/// once).
pub struct OutboxProcessor<O, S> {
    outbox: O,
    adapters: Arc<AdapterRegistry>,
    bus: Arc<EventBus<S>>,
}

impl<O, S> std::fmt::Debug for OutboxProcessor<O, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("producer", &self.adapters.producer())
            .finish_non_exhaustive()
    }
}

impl<O, S> OutboxProcessor<O, S>
where
    O: OutboxStore,
    S: StreamStore,
{
    pub fn new(outbox: O, adapters: Arc<AdapterRegistry>, bus: Arc<EventBus<S>>) -> Self {
        Self {
            outbox,
            adapters,
            bus,
        }
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn bus(&self) -> &Arc<EventBus<S>> {
        &self.bus
    }

    /// Drain one batch of up to `batch_size` rows; returns how many reached PUBLISHED.
    ///
    /// - A row that fails adaptation or is rejected by the bus is marked FAILED with the
    ///   reason, and the batch moves on to the next row.
    /// - A transient bus failure stops the batch. That row and everything after it stay
    ///   PENDING, which keeps per-aggregate order intact.
    /// - With nothing pending this returns `0` and touches nothing.
    #[instrument(skip(self), fields(published = tracing::field::Empty), err)]
    pub async fn process_pending_events(&self, batch_size: usize) -> Result<usize, OutboxError> {
        let rows = self.outbox.pending(batch_size).await?;
        let mut published = 0;

        for row in &rows {
            match self.publish(row).await {
                Ok(entry_id) => {
                    if self.outbox.mark_published(row.id).await? {
                        published += 1;
                    }
                    debug!(outbox_id = row.id, entry_id = %entry_id, "outbox row published");
                }
                Err(PublishFailure::Permanent(reason)) => {
                    warn!(
                        outbox_id = row.id,
                        event_type = %row.event_type,
                        error = %reason,
                        "outbox row failed; left for redrive"
                    );
                    self.outbox.mark_failed(row.id, &reason).await?;
                }
                Err(PublishFailure::Transient(err)) => {
                    warn!(
                        outbox_id = row.id,
                        event_type = %row.event_type,
                        error = %err,
                        "event bus unavailable; batch stopped, rows stay pending"
                    );
                    break;
                }
            }
        }

        tracing::Span::current().record("published", published);
        Ok(published)
    }

    async fn publish(&self, row: &OutboxRecord) -> Result<String, PublishFailure> {
        let native = row
            .native_event()
            .map_err(|e| PublishFailure::Permanent(e.to_string()))?;
        let envelope = self
            .adapters
            .adapt(&row.domain, &native, None, None)
            .map_err(|e| PublishFailure::Permanent(e.to_string()))?;

        self.bus.emit(&envelope).await.map_err(|e| {
            if e.is_transient() {
                PublishFailure::Transient(e)
            } else {
                PublishFailure::Permanent(e.to_string())
            }
        })
    }

    /// Drain every `interval` (at least 1 ms) until `cancel` fires.
    ///
    /// A failing cycle is logged and the loop carries on. Cancellation is checked between
    /// cycles, so an in-flight batch always finishes and no row is left half-processed.
    pub async fn start_processing_loop(
        &self,
        batch_size: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(batch_size, interval_ms = interval.as_millis() as u64, "outbox processor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.process_pending_events(batch_size).await {
                Ok(0) => debug!("outbox idle"),
                Ok(published) => info!(published, "outbox cycle published rows"),
                Err(err) => error!(error = %err, "outbox cycle failed"),
            }
        }

        info!("outbox processor stopped");
    }
}

impl<O, S> OutboxProcessor<O, S>
where
    O: OutboxStore + 'static,
    S: StreamStore + 'static,
{
    /// Run [`start_processing_loop`](Self::start_processing_loop) on its own task.
    pub fn spawn(
        self: Arc<Self>,
        batch_size: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.start_processing_loop(batch_size, interval, cancel).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use astra_events::{BusConfig, InMemoryStreamStore, NativeEvent, RawEntry, Registry};

    use super::*;
    use crate::outbox::{InMemoryOutbox, NewOutboxEvent, OutboxId, OutboxStats, OutboxStatus};

    type Processor = OutboxProcessor<Arc<InMemoryOutbox>, Arc<InMemoryStreamStore>>;

    async fn build<O: OutboxStore, S: StreamStore>(outbox: O, store: S) -> OutboxProcessor<O, S> {
        let registry = Arc::new(Registry::standard());
        let bus = Arc::new(EventBus::new(store, registry.clone(), BusConfig::default()));
        bus.connect().await.unwrap();
        let adapters = Arc::new(AdapterRegistry::standard(registry, "astra-test@0.1.0"));
        OutboxProcessor::new(outbox, adapters, bus)
    }

    async fn processor() -> (Processor, Arc<InMemoryOutbox>, Arc<InMemoryStreamStore>) {
        let store = Arc::new(InMemoryStreamStore::new());
        let outbox = InMemoryOutbox::arc();
        (build(outbox.clone(), store.clone()).await, outbox, store)
    }

    /// Stream store whose server refuses every append to one stream.
    struct RejectingStore {
        inner: Arc<InMemoryStreamStore>,
        rejected: &'static str,
    }

    #[async_trait]
    impl StreamStore for RejectingStore {
        async fn connect(&self) -> Result<(), BusError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }

        async fn ping(&self) -> Result<(), BusError> {
            self.inner.ping().await
        }

        async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BusError> {
            if stream == self.rejected {
                return Err(BusError::Command(
                    "XADD failed: WRONGTYPE Operation against a key holding the wrong kind of value"
                        .to_string(),
                ));
            }
            self.inner.append(stream, fields).await
        }

        async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
            self.inner.create_group(stream, group).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> Result<Vec<RawEntry>, BusError> {
            self.inner.read_group(stream, group, consumer, count, block).await
        }

        async fn claim_stale(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> Result<Vec<RawEntry>, BusError> {
            self.inner.claim_stale(stream, group, consumer, min_idle, count).await
        }

        async fn ack(&self, stream: &str, group: &str, entry_ids: &[String]) -> Result<u64, BusError> {
            self.inner.ack(stream, group, entry_ids).await
        }
    }

    /// Outbox whose first `failures` pending-row queries error out.
    struct FlakyOutbox {
        inner: Arc<InMemoryOutbox>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl OutboxStore for FlakyOutbox {
        async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(OutboxError::Storage("connection reset by peer".to_string()));
            }
            self.inner.pending(limit).await
        }

        async fn mark_published(&self, id: OutboxId) -> Result<bool, OutboxError> {
            self.inner.mark_published(id).await
        }

        async fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<bool, OutboxError> {
            self.inner.mark_failed(id, reason).await
        }

        async fn redrive(&self, ids: &[OutboxId]) -> Result<u64, OutboxError> {
            self.inner.redrive(ids).await
        }

        async fn redrive_all_failed(&self) -> Result<u64, OutboxError> {
            self.inner.redrive_all_failed().await
        }

        async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
            self.inner.get(id).await
        }

        async fn stats(&self) -> Result<OutboxStats, OutboxError> {
            self.inner.stats().await
        }
    }

    async fn wait_for_published(outbox: &InMemoryOutbox, expected: u64) {
        for _ in 0..100 {
            if outbox.stats().await.unwrap().published == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn stage(outbox: &InMemoryOutbox, events: &[NewOutboxEvent]) {
        let mut tx = outbox.begin();
        for event in events {
            tx.add_event(event.clone());
        }
        tx.commit();
    }

    fn xp(user: &str) -> NewOutboxEvent {
        let native = NativeEvent::new("XPGained", user, json!({"amount": 50}));
        NewOutboxEvent::from_native("gamification", &native).unwrap()
    }

    #[tokio::test]
    async fn empty_outbox_drains_nothing() {
        let (processor, outbox, _) = processor().await;
        stage(&outbox, &[xp("u1")]);
        assert_eq!(processor.process_pending_events(10).await.unwrap(), 1);
        let before = outbox.rows();

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 0);
        assert_eq!(outbox.rows(), before);
    }

    #[tokio::test]
    async fn batch_size_limits_one_cycle() {
        let (processor, outbox, store) = processor().await;
        stage(&outbox, &[xp("u1"), xp("u2"), xp("u3")]);

        assert_eq!(processor.process_pending_events(2).await.unwrap(), 2);
        assert_eq!(outbox.stats().await.unwrap().pending, 1);
        assert_eq!(store.len("astra.gamification.xpgained.v1"), 2);
    }

    #[tokio::test]
    async fn unknown_domain_marks_row_failed_with_reason() {
        let (processor, outbox, _) = processor().await;
        let native = NativeEvent::new("TradeExecuted", "t1", json!({}));
        stage(&outbox, &[NewOutboxEvent::from_native("weather", &native).unwrap()]);

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 0);
        let row = &outbox.rows()[0];
        assert_eq!(row.status, OutboxStatus::Failed);
        assert!(row.last_error.as_deref().unwrap().contains("weather"));
    }

    #[tokio::test]
    async fn unreachable_bus_leaves_rows_pending() {
        let (processor, outbox, _) = processor().await;
        stage(&outbox, &[xp("u1"), xp("u2")]);
        processor.bus().disconnect().await;

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 0);
        assert_eq!(outbox.stats().await.unwrap().pending, 2);

        processor.bus().connect().await.unwrap();
        assert_eq!(processor.process_pending_events(10).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn redelivered_row_keeps_its_event_id() {
        let (processor, outbox, store) = processor().await;
        stage(&outbox, &[xp("u1")]);
        processor.process_pending_events(10).await.unwrap();
        let row = outbox.rows()[0].clone();

        // Same payload drained again, as after a crash between emit and mark_published.
        stage(
            &outbox,
            &[NewOutboxEvent::new(row.domain, row.aggregate_id, row.event_type, row.payload)],
        );
        processor.process_pending_events(10).await.unwrap();

        let bus = processor.bus();
        let sub = bus
            .subscribe("astra.gamification.xpgained.v1", "audit", "c")
            .await
            .unwrap();
        let deliveries = bus.read(&sub).await.unwrap();
        assert_eq!(store.len("astra.gamification.xpgained.v1"), 2);
        assert_eq!(
            deliveries[0].envelope.event_id(),
            deliveries[1].envelope.event_id()
        );
    }

    #[tokio::test]
    async fn loop_drains_until_cancelled() {
        let (processor, outbox, _) = processor().await;
        let processor = Arc::new(processor);
        let cancel = CancellationToken::new();
        let handle = processor
            .clone()
            .spawn(10, Duration::from_millis(10), cancel.clone());

        stage(&outbox, &[xp("u1")]);
        wait_for_published(&outbox, 1).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(outbox.stats().await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn rejected_stream_fails_its_row_and_the_batch_continues() {
        let outbox = InMemoryOutbox::arc();
        let store = Arc::new(InMemoryStreamStore::new());
        let rejecting = RejectingStore {
            inner: store.clone(),
            rejected: "astra.trading.tradeexecuted.v1",
        };
        let processor = build(outbox.clone(), rejecting).await;

        let trade = NativeEvent::new("TradeExecuted", "trade_1", json!({"qty": 1}));
        stage(
            &outbox,
            &[
                NewOutboxEvent::from_native("trading", &trade).unwrap(),
                xp("u1"),
                xp("u2"),
                xp("u3"),
            ],
        );

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 3);
        let stats = outbox.stats().await.unwrap();
        assert_eq!(stats, OutboxStats { pending: 0, published: 3, failed: 1 });
        assert_eq!(store.len("astra.gamification.xpgained.v1"), 3);

        let trade_row = &outbox.rows()[0];
        assert_eq!(trade_row.status, OutboxStatus::Failed);
        assert!(trade_row.last_error.as_deref().unwrap().contains("WRONGTYPE"));
    }

    #[tokio::test]
    async fn plain_data_row_publishes_under_its_column_identity() {
        let (processor, outbox, _) = processor().await;
        stage(
            &outbox,
            &[NewOutboxEvent::new(
                "trading",
                "trade_test123",
                "TradeExecuted",
                json!({"symbol": "BTC"}),
            )],
        );

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 1);

        let bus = processor.bus();
        let sub = bus
            .subscribe("astra.trading.tradeexecuted.v1", "audit", "c")
            .await
            .unwrap();
        let deliveries = bus.read(&sub).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let envelope = &deliveries[0].envelope;
        assert_eq!(envelope.event_type(), "Trading.TradeExecuted");
        assert_eq!(envelope.entity_id(), "trade_test123");
        assert_eq!(envelope.data(), &json!({"symbol": "BTC"}));
    }

    #[tokio::test]
    async fn row_whose_payload_names_another_event_fails() {
        let (processor, outbox, store) = processor().await;
        let order = NativeEvent::new("OrderPlaced", "order_ZZZ", json!({}));
        stage(
            &outbox,
            &[NewOutboxEvent::new(
                "trading",
                "trade_AAA",
                "TradeExecuted",
                serde_json::to_value(&order).unwrap(),
            )],
        );

        assert_eq!(processor.process_pending_events(10).await.unwrap(), 0);
        let row = &outbox.rows()[0];
        assert_eq!(row.status, OutboxStatus::Failed);
        assert!(row.last_error.as_deref().unwrap().contains("OrderPlaced"));
        assert!(store.is_empty("astra.trading.orderplaced.v1"));
    }

    #[tokio::test]
    async fn failed_cycle_does_not_stop_the_loop() {
        let inner = InMemoryOutbox::arc();
        let flaky = FlakyOutbox {
            inner: inner.clone(),
            failures: AtomicUsize::new(2),
        };
        let processor = Arc::new(build(flaky, Arc::new(InMemoryStreamStore::new())).await);
        stage(&inner, &[xp("u1")]);

        let cancel = CancellationToken::new();
        let handle = processor
            .clone()
            .spawn(10, Duration::from_millis(5), cancel.clone());
        wait_for_published(&inner, 1).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(processor.outbox().failures.load(Ordering::SeqCst), 0);
        assert_eq!(inner.stats().await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn zero_interval_still_drains() {
        let (processor, outbox, _) = processor().await;
        let processor = Arc::new(processor);
        stage(&outbox, &[xp("u1")]);

        let cancel = CancellationToken::new();
        let handle = processor.clone().spawn(10, Duration::ZERO, cancel.clone());
        wait_for_published(&outbox, 1).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(outbox.stats().await.unwrap().published, 1);
    }
}
