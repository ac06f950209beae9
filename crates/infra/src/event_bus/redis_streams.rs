//! Redis Streams-backed [`StreamStore`] (durable, at-least-once delivery).
//!
//! | Bus operation | Redis command |
//! |---------------|---------------|
//! | `append` | `XADD <stream> * field value ...` |
//! | `create_group` | `XGROUP CREATE <stream> <group> 0 MKSTREAM` (BUSYGROUP ignored) |
//! | `read_group` | `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >` |
//! | `claim_stale` | `XAUTOCLAIM <stream> <group> <consumer> <min-idle-ms> 0-0 COUNT n` |
//! | `ack` | `XACK <stream> <group> id ...` |
//!
//! Blocking reads run on their own multiplexed connection so a long `BLOCK` never
//! delays appends and acks queued behind it. Requires Redis 6.2+ for `XAUTOCLAIM`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use astra_events::{BusError, RawEntry, StreamStore};

#[derive(Clone)]
struct Connections {
    commands: MultiplexedConnection,
    reads: MultiplexedConnection,
}

pub struct RedisStreamStore {
    client: redis::Client,
    connections: RwLock<Option<Connections>>,
}

impl std::fmt::Debug for RedisStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisStreamStore {
    /// Parse `redis_url`. No connection is made until [`StreamStore::connect`].
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            connections: RwLock::new(None),
        })
    }

    async fn commands(&self) -> Result<MultiplexedConnection, BusError> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.commands.clone())
            .ok_or_else(not_connected)
    }

    async fn reads(&self) -> Result<MultiplexedConnection, BusError> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.reads.clone())
            .ok_or_else(not_connected)
    }
}

fn not_connected() -> BusError {
    BusError::Connection("redis stream store is not connected".to_string())
}

/// Server replies that clear up on their own: loading, busy script, resharding, failover.
const RETRYABLE_CODES: [&str; 5] = ["LOADING", "BUSY", "TRYAGAIN", "CLUSTERDOWN", "MASTERDOWN"];

fn map_redis_error(command: &str, err: redis::RedisError) -> BusError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err
            .code()
            .is_some_and(|code| RETRYABLE_CODES.iter().any(|c| *c == code))
    {
        BusError::Connection(format!("{command} failed: {err}"))
    } else if err.code() == Some("NOGROUP") {
        BusError::ConsumerGroup(format!("{command} failed: {err}"))
    } else {
        BusError::Command(format!("{command} failed: {err}"))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn connect(&self) -> Result<(), BusError> {
        let commands = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("CONNECT", e))?;
        let reads = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("CONNECT", e))?;
        *self.connections.write().await = Some(Connections { commands, reads });
        debug!("redis stream store connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connections.write().await.take();
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.commands().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| map_redis_error("PING", e))?;
        Ok(())
    }

    #[instrument(skip(self, fields), err)]
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> Result<String, BusError> {
        let mut conn = self.commands().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))
    }

    #[instrument(skip(self), err)]
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.commands().await?;
        // "0" positions the group at the start of the stream.
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BusError> {
        let mut conn = self.reads().await?;
        // BLOCK 0 would wait forever.
        let block_ms = millis(block).max(1);
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async::<_, redis::Value>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        // Nil on timeout, else [[stream, [entry, ...]], ...]
        match reply {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(streams) => {
                let mut entries = Vec::new();
                for item in streams {
                    if let redis::Value::Bulk(mut pair) = item {
                        if pair.len() == 2 {
                            entries.extend(parse_entries(pair.swap_remove(1))?);
                        }
                    }
                }
                Ok(entries)
            }
            other => Err(BusError::Deserialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            ))),
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
        let mut conn = self.commands().await?;
        let reply = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async::<_, redis::Value>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XAUTOCLAIM", e))?;

        // [next-cursor, [entry, ...], (7.0+) [deleted-id, ...]]
        match reply {
            redis::Value::Bulk(mut parts) if parts.len() >= 2 => parse_entries(parts.swap_remove(1)),
            other => Err(BusError::Deserialization(format!(
                "unexpected XAUTOCLAIM reply: {other:?}"
            ))),
        }
    }

    #[instrument(skip(self, entry_ids), fields(count = entry_ids.len()), err)]
    async fn ack(&self, stream: &str, group: &str, entry_ids: &[String]) -> Result<u64, BusError> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.commands().await?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_ids)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))
    }
}

/// Parse `[[id, [field, value, ...]], ...]`.
///
/// Entries trimmed from the stream while pending come back with nil fields; they are
/// skipped.
fn parse_entries(value: redis::Value) -> Result<Vec<RawEntry>, BusError> {
    let items = match value {
        redis::Value::Bulk(items) => items,
        redis::Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(BusError::Deserialization(format!(
                "invalid entry list: {other:?}"
            )));
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let redis::Value::Bulk(parts) = item else {
            return Err(BusError::Deserialization("invalid entry format".to_string()));
        };
        let mut parts = parts.into_iter();
        let entry_id = match parts.next() {
            Some(redis::Value::Data(id)) => String::from_utf8_lossy(&id).into_owned(),
            Some(redis::Value::Status(id)) => id,
            _ => {
                return Err(BusError::Deserialization(
                    "invalid entry id format".to_string(),
                ));
            }
        };
        let raw_fields = match parts.next() {
            Some(redis::Value::Bulk(raw)) => raw,
            Some(redis::Value::Nil) | None => continue,
            Some(_) => {
                return Err(BusError::Deserialization(
                    "invalid fields format".to_string(),
                ));
            }
        };

        let mut fields = HashMap::with_capacity(raw_fields.len() / 2);
        for chunk in raw_fields.chunks(2) {
            if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                fields.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
        entries.push(RawEntry { entry_id, fields });
    }
    Ok(entries)
}
