use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use astra_core::EventId;

use crate::schema::stream_name;

/// Canonical, versioned envelope for a cross-domain event.
///
/// This is the unit appended to a stream and the wire contract every consumer honours.
///
/// Notes:
/// - Only [`Registry`](crate::Registry) hands out envelopes built locally, so every
///   envelope that reaches the bus has been validated.
/// - Fields are read-only; the bus never mutates or reorders an envelope.
/// - Unknown top-level fields are kept in `extensions` so additive revisions survive a
///   decode/encode cycle through older consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    domain: String,
    entity_id: String,
    occurred_at: DateTime<Utc>,
    event_version: u32,
    #[serde(default)]
    correlation_id: String,
    #[serde(default)]
    causation_id: String,
    producer: String,
    data: JsonValue,

    #[serde(flatten)]
    extensions: Map<String, JsonValue>,
}

/// Unvalidated envelope fields, as assembled by an adapter.
///
/// Turned into an [`EventEnvelope`] by [`Registry::seal`](crate::Registry::seal).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeDraft {
    pub event_id: EventId,
    pub event_type: String,
    pub domain: String,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_version: u32,
    pub correlation_id: String,
    pub causation_id: String,
    pub producer: String,
    pub data: JsonValue,
}

impl EventEnvelope {
    pub(crate) fn from_parts(draft: EnvelopeDraft, extensions: Map<String, JsonValue>) -> Self {
        Self {
            event_id: draft.event_id,
            event_type: draft.event_type,
            domain: draft.domain,
            entity_id: draft.entity_id,
            occurred_at: draft.occurred_at,
            event_version: draft.event_version,
            correlation_id: draft.correlation_id,
            causation_id: draft.causation_id,
            producer: draft.producer,
            data: draft.data,
            extensions,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> &str {
        &self.causation_id
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn extensions(&self) -> &Map<String, JsonValue> {
        &self.extensions
    }

    /// Name of the stream this envelope is published to.
    pub fn stream_name(&self) -> String {
        stream_name(&self.domain, &self.event_type, self.event_version)
    }
}
