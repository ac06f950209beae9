//! Postgres-backed outbox.
//!
//! ## Error mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxError |
//! |------------|----------------------|-------------|
//! | Database (check constraint violation) | `23514` | `Storage` (bad status/priority) |
//! | Database (not null violation) | `23502` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! Every failure is a storage failure from the drain loop's point of view; the table
//! only exists to carry the operation name into the message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{Span, instrument};

use super::{
    NewOutboxEvent, OutboxError, OutboxId, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore,
};

/// Applies `migrations/` (the `outbox_events` table).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SELECT_COLUMNS: &str = r#"
    id, domain, aggregate_id, event_type, payload, status, priority, last_error,
    created_at, updated_at
"#;

/// Outbox over the `outbox_events` table.
///
/// `PgPool` is internally reference-counted; cloning is cheap.
#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stage one PENDING row inside the caller's transaction.
    ///
    /// Never publishes anything itself. If the caller rolls back, the row is gone with
    /// the rest of the transaction. The outbox does not deduplicate.
    #[instrument(
        skip(tx, event),
        fields(
            domain = %event.domain,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            outbox_id = tracing::field::Empty
        ),
        err
    )]
    pub async fn add_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> Result<OutboxId, OutboxError> {
        let id: OutboxId = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_events (domain, aggregate_id, event_type, payload, priority)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&event.domain)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.priority)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("add_event", e))?;

        Span::current().record("outbox_id", id);
        Ok(id)
    }

    async fn transition(
        &self,
        operation: &str,
        id: OutboxId,
        from: OutboxStatus,
        to: OutboxStatus,
        last_error: Option<&str>,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $3, last_error = $4, updated_at = now()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if exists {
            Ok(false)
        } else {
            Err(OutboxError::NotFound(id))
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    #[instrument(skip(self), err)]
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM outbox_events
            WHERE status = 'pending'
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $1
            "#
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending", e))?;

        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool, OutboxError> {
        self.transition("mark_published", id, OutboxStatus::Pending, OutboxStatus::Published, None)
            .await
    }

    async fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<bool, OutboxError> {
        self.transition("mark_failed", id, OutboxStatus::Pending, OutboxStatus::Failed, Some(reason))
            .await
    }

    #[instrument(skip(self), err)]
    async fn redrive(&self, ids: &[OutboxId]) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', last_error = NULL, updated_at = now()
            WHERE id = ANY($1) AND status = 'failed'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("redrive", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn redrive_all_failed(&self) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', last_error = NULL, updated_at = now()
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("redrive_all_failed", e))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM outbox_events WHERE id = $1");
        let row: Option<OutboxRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(OutboxRecord::try_from).transpose()
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for (status, count) in counts {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Published => stats.published = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    domain: String,
    aggregate_id: String,
    event_type: String,
    payload: JsonValue,
    status: String,
    priority: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            domain: row.domain,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            priority: row.priority,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => OutboxError::Storage(format!("{msg} (check constraint)")),
                Some("23502") => OutboxError::Storage(format!("{msg} (not null)")),
                _ => OutboxError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("pending", sqlx::Error::PoolClosed);
        assert_eq!(
            err,
            OutboxError::Storage("connection pool closed in pending".to_string())
        );
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        let row = OutboxRow {
            id: 1,
            domain: "trading".to_string(),
            aggregate_id: "t".to_string(),
            event_type: "TradeExecuted".to_string(),
            payload: JsonValue::Null,
            status: "archived".to_string(),
            priority: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(OutboxRecord::try_from(row).is_err());
    }
}
