//! Transactional outbox.
//!
//! A domain operation stages its events in the same transaction as its state change
//! ([`PostgresOutbox::add_event`], or [`InMemoryOutbox::begin`] in tests). The
//! [`OutboxProcessor`] later drains PENDING rows in `(priority DESC, created_at ASC)`
//! order, adapts each row to an envelope and emits it on the event bus.
//!
//! ## Row lifecycle
//!
//! ```text
//! PENDING --adapt + emit ok--> PUBLISHED
//!    |
//!    +--adaptation / permanent publish failure--> FAILED --redrive--> PENDING
//! ```
//!
//! Transient bus failures leave the row PENDING; the next drain cycle retries it. FAILED
//! rows are only moved back by an explicit redrive. Rows are never deleted here.

mod in_memory;
mod postgres;
mod processor;
mod record;
mod store;

pub use in_memory::{InMemoryOutbox, InMemoryOutboxTx};
pub use postgres::{MIGRATOR, PostgresOutbox};
pub use processor::OutboxProcessor;
pub use record::{NewOutboxEvent, OutboxId, OutboxRecord, OutboxStats, OutboxStatus};
pub use store::OutboxStore;

/// Outbox storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox row not found: {0}")]
    NotFound(OutboxId),

    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error("outbox serialization error: {0}")]
    Serialization(String),
}
