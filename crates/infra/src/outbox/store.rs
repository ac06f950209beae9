use async_trait::async_trait;

use super::{OutboxError, OutboxId, OutboxRecord, OutboxStats};

/// Drain-side view of the outbox table.
///
/// Staging (`add_event`) is not part of this trait because it must run inside the
/// caller's own transaction; each backend exposes it on its transaction type.
///
/// Status transitions are conditional: `mark_*` only act on PENDING rows and `redrive`
/// only on FAILED rows, so concurrent drainers cannot move a row backwards.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` PENDING rows, ordered by priority (highest first), then
    /// `created_at`, then `id`.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// PENDING -> PUBLISHED. Returns `false` if the row was not PENDING, and
    /// [`OutboxError::NotFound`] if it does not exist.
    async fn mark_published(&self, id: OutboxId) -> Result<bool, OutboxError>;

    /// PENDING -> FAILED, recording `reason`. Returns `false` if the row was not PENDING.
    async fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<bool, OutboxError>;

    /// FAILED -> PENDING for the given rows; returns how many moved.
    async fn redrive(&self, ids: &[OutboxId]) -> Result<u64, OutboxError>;

    /// FAILED -> PENDING for every failed row; returns how many moved.
    async fn redrive_all_failed(&self) -> Result<u64, OutboxError>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

#[async_trait]
impl<T> OutboxStore for std::sync::Arc<T>
where
    T: OutboxStore + ?Sized,
{
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).pending(limit).await
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool, OutboxError> {
        (**self).mark_published(id).await
    }

    async fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<bool, OutboxError> {
        (**self).mark_failed(id, reason).await
    }

    async fn redrive(&self, ids: &[OutboxId]) -> Result<u64, OutboxError> {
        (**self).redrive(ids).await
    }

    async fn redrive_all_failed(&self) -> Result<u64, OutboxError> {
        (**self).redrive_all_failed().await
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        (**self).stats().await
    }
}
