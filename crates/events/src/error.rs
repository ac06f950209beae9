//! Error taxonomy of the event infrastructure.
//!
//! - [`SchemaValidationError`]: malformed or ineligible envelope, never published.
//! - [`AdapterError`]: producer-side misuse, caught before anything reaches the outbox or bus.
//! - [`BusError`]: the stream store rejected or could not durably accept an operation.

use thiserror::Error;

/// An envelope (or envelope candidate) failed validation.
///
/// `field` names the offending envelope field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema validation failed on `{field}`: {reason}")]
pub struct SchemaValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl SchemaValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure to turn a domain-native event into a canonical envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("no adapter registered for domain `{0}`")]
    UnknownDomain(String),

    #[error("cannot adapt native event, `{field}`: {reason}")]
    Adaptation { field: &'static str, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaValidationError),
}

impl AdapterError {
    pub fn adaptation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Adaptation {
            field,
            reason: reason.into(),
        }
    }
}

/// Stream-store / event bus error.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("stream store connection error: {0}")]
    Connection(String),

    #[error("stream store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("publish rejected: {0}")]
    Publish(#[from] SchemaValidationError),
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only an unreachable or temporarily unavailable store counts. A command the store
    /// answered with an error is permanent for that payload. Transient failures leave
    /// outbox rows PENDING; everything else marks them FAILED.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
