//! In-memory outbox for tests/dev.
//!
//! Staging goes through [`InMemoryOutboxTx`], which buffers rows until `commit`;
//! dropping the transaction without committing discards them, like a rolled-back
//! database transaction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::instrument;

use astra_core::{Clock, SystemClock};

use super::{
    NewOutboxEvent, OutboxError, OutboxId, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore,
};

pub struct InMemoryOutbox {
    rows: Mutex<BTreeMap<OutboxId, OutboxRecord>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutbox")
            .field("rows", &self.lock().len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a staging transaction.
    pub fn begin(&self) -> InMemoryOutboxTx<'_> {
        InMemoryOutboxTx {
            outbox: self,
            staged: Vec::new(),
        }
    }

    /// Every row in id order, regardless of status.
    pub fn rows(&self) -> Vec<OutboxRecord> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<OutboxId, OutboxRecord>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        id: OutboxId,
        from: OutboxStatus,
        to: OutboxStatus,
        last_error: Option<&str>,
    ) -> Result<bool, OutboxError> {
        let now = self.clock.now();
        let mut rows = self.lock();
        let row = rows.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        if row.status != from {
            return Ok(false);
        }
        row.status = to;
        row.last_error = last_error.map(str::to_string);
        row.updated_at = now;
        Ok(true)
    }
}

/// Staging transaction over an [`InMemoryOutbox`].
#[derive(Debug)]
pub struct InMemoryOutboxTx<'a> {
    outbox: &'a InMemoryOutbox,
    staged: Vec<OutboxRecord>,
}

impl InMemoryOutboxTx<'_> {
    /// Stage one PENDING row; visible to drainers only after [`commit`](Self::commit).
    ///
    /// Ids are allocated eagerly, so a rolled-back transaction leaves a gap, as a
    /// database sequence does.
    pub fn add_event(&mut self, event: NewOutboxEvent) -> OutboxId {
        let id = self.outbox.next_id.fetch_add(1, Ordering::AcqRel);
        let now = self.outbox.clock.now();
        self.staged.push(OutboxRecord {
            id,
            domain: event.domain,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Pending,
            priority: event.priority,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn commit(self) {
        let mut rows = self.outbox.lock();
        for row in self.staged {
            rows.insert(row.id, row);
        }
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    #[instrument(skip(self))]
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut pending: Vec<OutboxRecord> = self
            .lock()
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool, OutboxError> {
        self.transition(id, OutboxStatus::Pending, OutboxStatus::Published, None)
    }

    async fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<bool, OutboxError> {
        self.transition(id, OutboxStatus::Pending, OutboxStatus::Failed, Some(reason))
    }

    async fn redrive(&self, ids: &[OutboxId]) -> Result<u64, OutboxError> {
        let mut moved = 0;
        for id in ids {
            match self.transition(*id, OutboxStatus::Failed, OutboxStatus::Pending, None) {
                Ok(true) => moved += 1,
                Ok(false) | Err(OutboxError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(moved)
    }

    async fn redrive_all_failed(&self) -> Result<u64, OutboxError> {
        let failed: Vec<OutboxId> = self
            .lock()
            .values()
            .filter(|r| r.status == OutboxStatus::Failed)
            .map(|r| r.id)
            .collect();
        self.redrive(&failed).await
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let mut stats = OutboxStats::default();
        for row in self.lock().values() {
            match row.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_core::FixedClock;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn event(aggregate: &str) -> NewOutboxEvent {
        NewOutboxEvent::new("trading", aggregate, "TradeExecuted", json!({}))
    }

    #[tokio::test]
    async fn committed_rows_are_pending() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin();
        let id = tx.add_event(event("t1"));
        tx.commit();

        let row = outbox.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(outbox.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing_behind() {
        let outbox = InMemoryOutbox::new();
        {
            let mut tx = outbox.begin();
            tx.add_event(event("t1"));
        }
        let mut tx = outbox.begin();
        tx.add_event(event("t2"));
        tx.rollback();

        assert!(outbox.rows().is_empty());
        assert!(outbox.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_orders_by_priority_then_age() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let outbox = InMemoryOutbox::with_clock(Arc::new(FixedClock(t0)));

        let mut tx = outbox.begin();
        let low = tx.add_event(event("a"));
        let negative = tx.add_event(event("b").with_priority(-1));
        let high = tx.add_event(event("c").with_priority(10));
        let low_later = tx.add_event(event("d"));
        tx.commit();

        let order: Vec<OutboxId> = outbox.pending(10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![high, low, low_later, negative]);

        let first_two: Vec<OutboxId> = outbox.pending(2).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(first_two, vec![high, low]);
    }

    #[tokio::test]
    async fn older_rows_of_equal_priority_drain_first() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = InMemoryOutbox::with_clock(Arc::new(FixedClock(t0 + Duration::seconds(5))));
        let mut tx = late.begin();
        let newer = tx.add_event(event("a"));
        tx.commit();

        let mut older = late.get(newer).await.unwrap().unwrap();
        older.id = 99;
        older.created_at = t0;
        late.lock().insert(older.id, older);

        let order: Vec<OutboxId> = late.pending(10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![99, newer]);
    }

    #[tokio::test]
    async fn transitions_only_move_forward() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin();
        let id = tx.add_event(event("t1"));
        tx.commit();

        assert!(outbox.mark_published(id).await.unwrap());
        assert!(!outbox.mark_failed(id, "late failure").await.unwrap());
        assert_eq!(outbox.redrive(&[id]).await.unwrap(), 0);
        assert_eq!(
            outbox.get(id).await.unwrap().unwrap().status,
            OutboxStatus::Published
        );
        assert_eq!(outbox.mark_published(404).await, Err(OutboxError::NotFound(404)));
    }

    #[tokio::test]
    async fn redrive_moves_failed_rows_back_and_clears_error() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin();
        let a = tx.add_event(event("a"));
        let b = tx.add_event(event("b"));
        tx.commit();
        outbox.mark_failed(a, "bad payload").await.unwrap();
        outbox.mark_failed(b, "bad payload").await.unwrap();

        assert_eq!(
            outbox.get(a).await.unwrap().unwrap().last_error.as_deref(),
            Some("bad payload")
        );
        assert_eq!(outbox.redrive(&[a, 404]).await.unwrap(), 1);
        let row = outbox.get(a).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.last_error, None);

        assert_eq!(outbox.redrive_all_failed().await.unwrap(), 1);
        assert_eq!(
            outbox.stats().await.unwrap(),
            OutboxStats {
                pending: 2,
                published: 0,
                failed: 0
            }
        );
    }

    proptest! {
        #[test]
        fn pending_is_priority_desc_then_id_asc(priorities in prop::collection::vec(-5i32..5, 0..30)) {
            let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let outbox = InMemoryOutbox::with_clock(Arc::new(FixedClock(t0)));
            let mut tx = outbox.begin();
            for p in &priorities {
                tx.add_event(event("a").with_priority(*p));
            }
            tx.commit();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let pending = rt.block_on(outbox.pending(usize::MAX)).unwrap();

            prop_assert_eq!(pending.len(), priorities.len());
            for pair in pending.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(
                    a.priority > b.priority || (a.priority == b.priority && a.id < b.id)
                );
            }
        }
    }
}
