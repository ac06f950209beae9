//! Infrastructure layer: Postgres outbox, Redis streams, configuration.

pub mod config;
pub mod event_bus;
pub mod outbox;


pub use config::{AstraConfig, ConfigError, ConfigLoader};
pub use outbox::{
    InMemoryOutbox, NewOutboxEvent, OutboxError, OutboxId, OutboxProcessor, OutboxRecord,
    OutboxStats, OutboxStatus, OutboxStore, PostgresOutbox,
};
