//! Cross-domain event contract and stream bus.
//!
//! - [`EventEnvelope`] is the canonical wire shape; [`Registry`] is the only way to
//!   obtain one, so every envelope in circulation has passed validation.
//! - [`AdapterRegistry`] turns domain-native events into envelopes.
//! - [`EventBus`] appends envelopes to per-event streams of a [`StreamStore`] and runs
//!   consumer groups over them.
//!
//! Storage-specific stores (Redis) live in `astra-infra`.

pub mod adapter;
pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod in_memory_bus;
pub mod metrics;
pub mod schema;

pub use adapter::{AdaptContext, Adapter, AdapterRegistry, NativeEvent, StandardAdapter};
pub use bus::{
    BusConfig, ConsumerState, Delivery, EventBus, RawEntry, StreamStore, Subscription,
};
pub use consumer::{ConsumerHandle, EnvelopeHandler};
pub use envelope::{EnvelopeDraft, EventEnvelope};
pub use error::{AdapterError, BusError, SchemaValidationError};
pub use in_memory_bus::InMemoryStreamStore;
pub use metrics::{BusMetrics, HealthReport, HealthStatus, MetricsSnapshot};
pub use schema::{DomainSpec, Registry, STREAM_PREFIX, is_well_formed_event_type, stream_name};
