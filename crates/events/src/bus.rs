//! Event bus over a partitioned, replayable stream store.
//!
//! The bus accepts validated envelopes and appends each one to its own stream
//! (`astra.<domain>.<action>.v<version>`), and manages consumer groups reading those
//! streams.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: an entry stays pending for its consumer group until acked. An
//!   entry left unacked longer than the claim timeout is handed to whichever consumer of
//!   the same group reads next, so a crashed consumer's work is picked up by its peers.
//! - **Ordering**: total order within one stream only.
//! - **No retry inside the bus**: `emit` surfaces transient failures to the caller. The
//!   outbox drain loop one layer up re-attempts on its next cycle.
//!
//! ## Consumer group lifecycle
//!
//! ```text
//! JOINING --subscribe--> ACTIVE (read / ack) --shutdown--> DETACHED
//! ```
//!
//! Delivery state belongs to the group inside the store, never to a process. A group
//! re-joined under the same name sees the pending entries its previous members left.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::envelope::EventEnvelope;
use crate::error::BusError;
use crate::metrics::{BusMetrics, HealthReport, HealthStatus, MetricsSnapshot};
use crate::schema::Registry;

/// Raw entry as stored in a stream: store-assigned id plus string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub entry_id: String,
    pub fields: HashMap<String, String>,
}

/// Append-only stream storage with consumer groups (e.g. Redis Streams).
///
/// Implementations own all consumer-group state (cursor and pending entries); clients
/// keep nothing across restarts.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Acquire the underlying connection.
    async fn connect(&self) -> Result<(), BusError>;

    /// Release the connection. Safe to call even if `connect` failed or never ran.
    async fn disconnect(&self);

    async fn ping(&self) -> Result<(), BusError>;

    /// Append an entry to `stream`, returning its store-assigned id.
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BusError>;

    /// Create `group` positioned at the start of `stream` (idempotent; creates the stream).
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting at most `block`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BusError>;

    /// Transfer entries pending longer than `min_idle` (in any consumer) to `consumer`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError>;

    /// Acknowledge entries for `group`; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, entry_ids: &[String]) -> Result<u64, BusError>;
}

#[async_trait]
impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    async fn connect(&self) -> Result<(), BusError> {
        (**self).connect().await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }

    async fn ping(&self) -> Result<(), BusError> {
        (**self).ping().await
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BusError> {
        (**self).append(stream, fields).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        (**self).create_group(stream, group).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BusError> {
        (**self).read_group(stream, group, consumer, count, block).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        (**self)
            .claim_stale(stream, group, consumer, min_idle, count)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, entry_ids: &[String]) -> Result<u64, BusError> {
        (**self).ack(stream, group, entry_ids).await
    }
}

/// Tunables for reading and liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Idle time after which an unacked entry may be re-delivered to another consumer.
    pub claim_timeout: Duration,
    /// Upper bound on one blocking read, so cancellation is observed promptly.
    pub block: Duration,
    pub read_count: usize,
    pub health_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(30),
            block: Duration::from_secs(1),
            read_count: 10,
            health_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Joining,
    Active,
    Detached,
}

/// Membership of one consumer in one consumer group of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    stream: String,
    group: String,
    consumer: String,
    state: ConsumerState,
}

impl Subscription {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Leave the group. Unacked entries stay claimable by the group's other members.
    pub fn detach(&mut self) {
        self.state = ConsumerState::Detached;
    }
}

/// An entry handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub entry_id: String,
    pub stream: String,
    pub envelope: EventEnvelope,
}

/// Publishes envelopes to streams and manages consumer groups.
#[derive(Debug)]
pub struct EventBus<S> {
    store: S,
    registry: Arc<Registry>,
    config: BusConfig,
    metrics: BusMetrics,
    running: AtomicBool,
    pub(crate) consumer_tasks: AtomicUsize,
}

impl<S: StreamStore> EventBus<S> {
    pub fn new(store: S, registry: Arc<Registry>, config: BusConfig) -> Self {
        Self {
            store,
            registry,
            config,
            metrics: BusMetrics::default(),
            running: AtomicBool::new(false),
            consumer_tasks: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.store.connect().await?;
        self.running.store(true, Ordering::Release);
        info!("event bus connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::Release);
        self.store.disconnect().await;
        info!("event bus disconnected");
    }

    /// Validate `envelope` and append it to its stream, returning the entry id.
    #[instrument(
        skip(self, envelope),
        fields(
            event_type = %envelope.event_type(),
            event_id = %envelope.event_id(),
            entity_id = %envelope.entity_id()
        ),
        err
    )]
    pub async fn emit(&self, envelope: &EventEnvelope) -> Result<String, BusError> {
        let started = Instant::now();
        match self.append_envelope(envelope).await {
            Ok(entry_id) => {
                self.metrics.record_published(started.elapsed());
                Ok(entry_id)
            }
            Err(err) => {
                self.metrics.record_failed();
                Err(err)
            }
        }
    }

    async fn append_envelope(&self, envelope: &EventEnvelope) -> Result<String, BusError> {
        self.registry.validate_envelope(envelope)?;

        let stream = envelope.stream_name();
        let payload =
            serde_json::to_string(envelope).map_err(|e| BusError::Serialization(e.to_string()))?;

        let fields = [
            ("event_id", envelope.event_id().to_string()),
            ("event_type", envelope.event_type().to_string()),
            ("entity_id", envelope.entity_id().to_string()),
            ("payload", payload),
        ];
        self.store.append(&stream, &fields).await
    }

    /// Join `group` on `stream` as `consumer`.
    ///
    /// A group that does not exist yet is created at the start of the stream, so a
    /// newly-deployed consumer sees the full history.
    #[instrument(skip(self), err)]
    pub async fn subscribe(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription, BusError> {
        let mut subscription = Subscription {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            state: ConsumerState::Joining,
        };
        self.store.create_group(stream, group).await?;
        subscription.state = ConsumerState::Active;
        info!(stream, group, consumer, "joined consumer group");
        Ok(subscription)
    }

    /// Next batch for `subscription`: stale entries of the group first, then new ones.
    pub async fn read(&self, subscription: &Subscription) -> Result<Vec<Delivery>, BusError> {
        if subscription.state != ConsumerState::Active {
            return Err(BusError::ConsumerGroup(format!(
                "consumer `{}` is not active in group `{}`",
                subscription.consumer, subscription.group
            )));
        }

        let mut raw = self
            .store
            .claim_stale(
                &subscription.stream,
                &subscription.group,
                &subscription.consumer,
                self.config.claim_timeout,
                self.config.read_count,
            )
            .await?;
        if raw.is_empty() {
            raw = self
                .store
                .read_group(
                    &subscription.stream,
                    &subscription.group,
                    &subscription.consumer,
                    self.config.read_count,
                    self.config.block,
                )
                .await?;
        }

        let mut deliveries = Vec::with_capacity(raw.len());
        for entry in raw {
            match decode_entry(&entry) {
                Ok(envelope) => deliveries.push(Delivery {
                    entry_id: entry.entry_id,
                    stream: subscription.stream.clone(),
                    envelope,
                }),
                Err(err) => {
                    // Undecodable entries would be redelivered forever.
                    warn!(
                        stream = %subscription.stream,
                        entry_id = %entry.entry_id,
                        error = %err,
                        "dropping undecodable stream entry"
                    );
                    self.metrics.record_failed();
                    self.store
                        .ack(&subscription.stream, &subscription.group, &[entry.entry_id])
                        .await?;
                }
            }
        }

        self.metrics.record_consumed(deliveries.len() as u64);
        Ok(deliveries)
    }

    /// Mark `entry_id` as processed for the subscription's group.
    pub async fn ack(&self, subscription: &Subscription, entry_id: &str) -> Result<(), BusError> {
        self.store
            .ack(
                &subscription.stream,
                &subscription.group,
                &[entry_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Liveness probe; bounded by `health_timeout` so a stalled store reports DEGRADED.
    pub async fn health_check(&self) -> HealthReport {
        let running = self.is_running();
        let reachable = matches!(
            tokio::time::timeout(self.config.health_timeout, self.store.ping()).await,
            Ok(Ok(()))
        );
        HealthReport {
            status: if running && reachable {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            consumer_tasks: self.consumer_tasks.load(Ordering::Acquire),
            running,
        }
    }
}

fn decode_entry(entry: &RawEntry) -> Result<EventEnvelope, BusError> {
    let payload = entry
        .fields
        .get("payload")
        .ok_or_else(|| BusError::Deserialization("missing payload field".to_string()))?;
    serde_json::from_str(payload)
        .map_err(|e| BusError::Deserialization(format!("failed to decode envelope: {e}")))
}
