//! Long-lived consumer-group reader task.
//!
//! The task reads a batch, hands each delivery to the handler, acks on success and
//! leaves failures pending so they are re-delivered after the claim timeout. It stops
//! on cancellation once the in-flight batch is done; reads are bounded by
//! `BusConfig::block`, so shutdown is observed within one block interval.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Delivery, EventBus, StreamStore, Subscription};

/// Processes deliveries for a consumer group. Must be idempotent.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    type Error: core::fmt::Debug + Send;

    async fn handle(&self, delivery: &Delivery) -> Result<(), Self::Error>;
}

#[async_trait]
impl<F, E> EnvelopeHandler for F
where
    F: Fn(&Delivery) -> Result<(), E> + Send + Sync + 'static,
    E: core::fmt::Debug + Send + 'static,
{
    type Error = E;

    async fn handle(&self, delivery: &Delivery) -> Result<(), E> {
        (self)(delivery)
    }
}

/// Handle to a running consumer task.
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    join: JoinHandle<Subscription>,
}

impl ConsumerHandle {
    /// Request cooperative shutdown and wait for the task; yields the detached subscription.
    pub async fn shutdown(self) -> Option<Subscription> {
        self.cancel.cancel();
        self.join.await.ok()
    }

    /// Abort the task without acking anything in flight, as a crash would.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Counts a consumer task for `health_check` until the task's future is dropped,
/// including when it is aborted before its first poll.
struct TaskCount<S>(Arc<EventBus<S>>);

impl<S> TaskCount<S> {
    fn register(bus: &Arc<EventBus<S>>) -> Self {
        bus.consumer_tasks.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(bus))
    }
}

impl<S> Drop for TaskCount<S> {
    fn drop(&mut self) {
        self.0.consumer_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<S: StreamStore + 'static> EventBus<S> {
    /// Spawn a reader task for `subscription`, cancelled via (a child of) `cancel`.
    pub fn spawn_consumer<H>(
        self: &Arc<Self>,
        subscription: Subscription,
        handler: H,
        cancel: &CancellationToken,
    ) -> ConsumerHandle
    where
        H: EnvelopeHandler,
    {
        let cancel = cancel.child_token();
        let join = tokio::spawn(run_consumer(
            TaskCount::register(self),
            subscription,
            handler,
            cancel.clone(),
        ));
        ConsumerHandle { cancel, join }
    }
}

async fn run_consumer<S, H>(
    task: TaskCount<S>,
    mut subscription: Subscription,
    handler: H,
    cancel: CancellationToken,
) -> Subscription
where
    S: StreamStore,
    H: EnvelopeHandler,
{
    let bus = &task.0;
    info!(
        stream = %subscription.stream(),
        group = %subscription.group(),
        consumer = %subscription.consumer(),
        "consumer started"
    );

    while !cancel.is_cancelled() {
        let deliveries = match bus.read(&subscription).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                warn!(
                    stream = %subscription.stream(),
                    group = %subscription.group(),
                    error = %err,
                    "stream read failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(bus.config().block) => continue,
                }
            }
        };

        for delivery in deliveries {
            match handler.handle(&delivery).await {
                Ok(()) => {
                    if let Err(err) = bus.ack(&subscription, &delivery.entry_id).await {
                        warn!(entry_id = %delivery.entry_id, error = %err, "ack failed");
                    }
                }
                Err(err) => {
                    warn!(
                        entry_id = %delivery.entry_id,
                        event_type = %delivery.envelope.event_type(),
                        error = ?err,
                        "handler failed; entry left pending for redelivery"
                    );
                }
            }
        }
    }

    subscription.detach();
    info!(
        stream = %subscription.stream(),
        group = %subscription.group(),
        consumer = %subscription.consumer(),
        "consumer detached"
    );
    subscription
}
