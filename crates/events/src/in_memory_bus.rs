//! In-memory stream store for tests/dev.
//!
//! Mirrors the Redis Streams semantics the bus relies on: per-stream entry ids,
//! consumer groups starting at the beginning, a pending list per group and idle-based
//! claiming. Everything lives behind one mutex; readers wait on a `Notify`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::{RawEntry, StreamStore};
use crate::error::BusError;

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<RawEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// entry index -> pending delivery
    pending: BTreeMap<usize, Pending>,
}

#[derive(Debug, Clone)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
}

/// In-memory [`StreamStore`].
///
/// Starts connected. `disconnect` makes every call fail with a connection error until
/// `connect` is called again, which is how tests simulate an unreachable store.
#[derive(Debug)]
pub struct InMemoryStreamStore {
    streams: Mutex<HashMap<String, StreamState>>,
    connected: AtomicBool,
    appended: Notify,
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            appended: Notify::new(),
        }
    }
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries ever appended to `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Number of delivered-but-unacked entries of `group`.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Unacked entries of `group` currently owned by `consumer`.
    pub fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.values().filter(|p| p.consumer == consumer).count())
    }

    /// Names of all streams with at least one entry or group.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::Connection("in-memory stream store is disconnected".to_string()))
        }
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let end = entries.len().min(group_state.cursor + count);
        let mut delivered = Vec::with_capacity(end - group_state.cursor);
        for index in group_state.cursor..end {
            group_state.pending.insert(
                index,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
            delivered.push(entries[index].clone());
        }
        group_state.cursor = end;
        Ok(delivered)
    }
}

fn no_group(stream: &str, group: &str) -> BusError {
    BusError::ConsumerGroup(format!("NOGROUP no consumer group `{group}` on stream `{stream}`"))
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn connect(&self) -> Result<(), BusError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.appended.notify_waiters();
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.ensure_connected()
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BusError> {
        self.ensure_connected()?;
        let entry_id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let entry_id = format!("{}-0", state.entries.len() + 1);
            state.entries.push(RawEntry {
                entry_id: entry_id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            });
            entry_id
        };
        self.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        let mut streams = self.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BusError> {
        self.ensure_connected()?;
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before checking, so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.deliver_new(stream, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.ensure_connected()?;
        }
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        self.ensure_connected()?;
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (index, pending) in group_state.pending.iter_mut() {
            if claimed.len() == count {
                break;
            }
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                claimed.push(entries[*index].clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, entry_ids: &[String]) -> Result<u64, BusError> {
        self.ensure_connected()?;
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let StreamState { entries, groups } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in entry_ids {
            if let Some(index) = entries.iter().position(|e| &e.entry_id == id) {
                if group_state.pending.remove(&index).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: u32) -> Vec<(&'static str, String)> {
        vec![("payload", format!("{{\"n\":{n}}}"))]
    }

    #[tokio::test]
    async fn new_group_starts_from_beginning() {
        let store = InMemoryStreamStore::new();
        store.append("s", &fields(1)).await.unwrap();
        store.append("s", &fields(2)).await.unwrap();

        store.create_group("s", "g").await.unwrap();
        let got = store
            .read_group("s", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].entry_id, "1-0");
        assert_eq!(store.pending_count("s", "g"), 2);
    }

    #[tokio::test]
    async fn groups_progress_independently() {
        let store = InMemoryStreamStore::new();
        store.create_group("s", "a").await.unwrap();
        store.create_group("s", "b").await.unwrap();
        store.append("s", &fields(1)).await.unwrap();

        let a = store.read_group("s", "a", "c", 10, Duration::ZERO).await.unwrap();
        let b = store.read_group("s", "b", "c", 10, Duration::ZERO).await.unwrap();
        let a_again = store.read_group("s", "a", "c", 10, Duration::ZERO).await.unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(a_again.is_empty());
    }

    #[tokio::test]
    async fn stale_entries_are_claimable_after_idle_time() {
        let store = InMemoryStreamStore::new();
        store.create_group("s", "g").await.unwrap();
        store.append("s", &fields(1)).await.unwrap();
        store.read_group("s", "g", "a", 10, Duration::ZERO).await.unwrap();

        let early = store
            .claim_stale("s", "g", "b", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let late = store
            .claim_stale("s", "g", "b", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(late.len(), 1);

        assert_eq!(store.ack("s", "g", &[late[0].entry_id.clone()]).await.unwrap(), 1);
        assert_eq!(store.pending_count("s", "g"), 0);
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_append() {
        let store = std::sync::Arc::new(InMemoryStreamStore::new());
        store.create_group("s", "g").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group("s", "g", "c", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", &fields(7)).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn disconnected_store_rejects_calls() {
        let store = InMemoryStreamStore::new();
        store.disconnect().await;
        assert!(matches!(
            store.append("s", &fields(1)).await,
            Err(BusError::Connection(_))
        ));
        assert!(store.ping().await.is_err());

        store.connect().await.unwrap();
        assert!(store.append("s", &fields(1)).await.is_ok());
    }

    #[tokio::test]
    async fn reading_unknown_group_fails() {
        let store = InMemoryStreamStore::new();
        store.append("s", &fields(1)).await.unwrap();
        assert!(matches!(
            store.read_group("s", "nope", "c", 1, Duration::ZERO).await,
            Err(BusError::ConsumerGroup(_))
        ));
    }
}
