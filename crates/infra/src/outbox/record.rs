use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use astra_core::EventId;
use astra_events::{AdapterError, NativeEvent};

use super::OutboxError;

/// Primary key of an outbox row; allocation order defines the default drain order.
pub type OutboxId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(OutboxError::Storage(format!("unknown outbox status `{other}`"))),
        }
    }
}

/// One staged event.
///
/// `payload` is the pre-adaptation, domain-native shape ([`NativeEvent`] as JSON).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub domain: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub priority: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Top-level keys that mark a payload as a serialized [`NativeEvent`].
const NATIVE_KEYS: [&str; 3] = ["event_type", "entity_id", "event_id"];

impl OutboxRecord {
    /// The native event this row describes.
    ///
    /// A payload carrying any of the native keys is read as a [`NativeEvent`]; anything
    /// else is taken as the event's `data`. Either way the `event_type` and
    /// `aggregate_id` columns fill in what the payload leaves out, and a payload that
    /// names a different event type or entity than its columns is rejected.
    pub fn native_event(&self) -> Result<NativeEvent, AdapterError> {
        let is_native = self
            .payload
            .as_object()
            .is_some_and(|obj| NATIVE_KEYS.iter().any(|key| obj.contains_key(*key)));

        let mut native = if is_native {
            serde_json::from_value::<NativeEvent>(self.payload.clone())
                .map_err(|e| AdapterError::adaptation("payload", e.to_string()))?
        } else {
            NativeEvent {
                data: self.payload.clone(),
                ..NativeEvent::default()
            }
        };

        reconcile(&mut native.event_type, &self.event_type, "event_type", action)?;
        reconcile(&mut native.entity_id, &self.aggregate_id, "entity_id", str::to_string)?;
        Ok(native)
    }
}

/// Event type without its domain qualifier.
fn action(event_type: &str) -> String {
    event_type.rsplit('.').next().unwrap_or(event_type).to_string()
}

fn reconcile(
    field: &mut Option<String>,
    column: &str,
    name: &'static str,
    key: fn(&str) -> String,
) -> Result<(), AdapterError> {
    if column.is_empty() {
        return Ok(());
    }
    match field.as_deref().filter(|v| !v.is_empty()) {
        None => {
            *field = Some(column.to_string());
            Ok(())
        }
        Some(value) if key(value) == key(column) => Ok(()),
        Some(value) => Err(AdapterError::adaptation(
            name,
            format!("payload has `{value}` but the row is staged as `{column}`"),
        )),
    }
}

/// An event to stage in the caller's transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub domain: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub priority: i32,
}

impl NewOutboxEvent {
    /// Stage an arbitrary payload. It is only interpreted when drained, so a payload that
    /// cannot be adapted surfaces as a FAILED row rather than an error here.
    ///
    /// `payload` is either a serialized [`NativeEvent`] or the plain event data. Plain
    /// data gets a fresh `event_id` on every drain; use [`from_native`](Self::from_native)
    /// when redeliveries must share one.
    pub fn new(
        domain: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            domain: domain.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            priority: 0,
        }
    }

    /// Stage a native event.
    ///
    /// `event_id` and `occurred_at` are fixed now when absent, so a row drained more than
    /// once (at-least-once) always produces the same envelope identity.
    pub fn from_native(domain: impl Into<String>, native: &NativeEvent) -> Result<Self, OutboxError> {
        let mut native = native.clone();
        native
            .event_id
            .get_or_insert_with(|| EventId::new().to_string());
        native.occurred_at.get_or_insert_with(Utc::now);

        let payload = serde_json::to_value(&native)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(Self::new(
            domain,
            native.entity_id.unwrap_or_default(),
            native.event_type.unwrap_or_default(),
            payload,
        ))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    pub failed: u64,
}
