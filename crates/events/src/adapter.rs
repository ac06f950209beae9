//! Domain adapters.
//!
//! Each domain emits events in whatever shape suits it (a [`NativeEvent`]). An
//! [`Adapter`] turns that into a schema-valid [`EventEnvelope`]; the
//! [`AdapterRegistry`] routes by domain name so new domains only register one more
//! adapter.
//!
//! Adapting is a pure function of its inputs plus the current time: no I/O, no shared
//! mutable state. Adapters for different domains may run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use astra_core::{Clock, EventId, SystemClock};

use crate::envelope::{EnvelopeDraft, EventEnvelope};
use crate::error::AdapterError;
use crate::schema::Registry;

/// Lightweight, domain-native event as produced by business logic.
///
/// Only `event_type` and `entity_id` are required to adapt; everything else is filled
/// in by the adapter when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl NativeEvent {
    pub fn new(event_type: impl Into<String>, entity_id: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_type: Some(event_type.into()),
            entity_id: Some(entity_id.into()),
            data,
            ..Self::default()
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Inputs shared by every adaptation call.
#[derive(Debug, Clone, Copy)]
pub struct AdaptContext<'a> {
    pub registry: &'a Registry,
    pub producer: &'a str,
    pub now: DateTime<Utc>,
    pub correlation_id: Option<&'a str>,
    pub causation_id: Option<&'a str>,
}

/// Capability to convert one domain's native events into envelopes.
pub trait Adapter: Send + Sync {
    /// Lowercase domain this adapter is registered under.
    fn domain(&self) -> &str;

    fn adapt(&self, native: &NativeEvent, ctx: &AdaptContext<'_>) -> Result<EventEnvelope, AdapterError>;
}

/// Adapter for the platform's built-in domains.
///
/// Domains differ only in where their events keep the aggregate id when the producer
/// did not set `entity_id` explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardAdapter {
    domain: String,
    entity_keys: Vec<&'static str>,
}

impl StandardAdapter {
    pub fn new(domain: impl Into<String>, entity_keys: Vec<&'static str>) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
            entity_keys,
        }
    }

    pub fn trading() -> Self {
        Self::new("trading", vec!["trade_id", "order_id", "position_id"])
    }

    pub fn gamification() -> Self {
        Self::new("gamification", vec!["user_id", "quest_id"])
    }

    pub fn financial() -> Self {
        Self::new("financial", vec!["transaction_id", "wallet_id", "payment_id"])
    }

    pub fn social() -> Self {
        Self::new("social", vec!["post_id", "comment_id", "user_id"])
    }

    pub fn nft() -> Self {
        Self::new("nft", vec!["token_id", "nft_id"])
    }

    pub fn user() -> Self {
        Self::new("user", vec!["user_id"])
    }

    fn entity_id(&self, native: &NativeEvent) -> Result<String, AdapterError> {
        if let Some(id) = native.entity_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        self.entity_keys
            .iter()
            .find_map(|key| match native.data.get(*key) {
                Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(JsonValue::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| AdapterError::adaptation("entity_id", "missing"))
    }
}

impl Adapter for StandardAdapter {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn adapt(&self, native: &NativeEvent, ctx: &AdaptContext<'_>) -> Result<EventEnvelope, AdapterError> {
        let raw_type = native
            .event_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::adaptation("event_type", "missing"))?;

        let event_type = ctx
            .registry
            .qualify(&self.domain, raw_type)
            .ok_or_else(|| AdapterError::UnknownDomain(self.domain.clone()))?;
        match ctx.registry.domain_of(&event_type) {
            Some(owner) if owner == self.domain => {}
            Some(owner) => {
                return Err(AdapterError::adaptation(
                    "event_type",
                    format!("`{event_type}` belongs to domain `{owner}`, not `{}`", self.domain),
                ));
            }
            None => {
                return Err(AdapterError::adaptation(
                    "event_type",
                    format!("`{event_type}` is not a registered event type"),
                ));
            }
        }

        let entity_id = self.entity_id(native)?;

        let event_id = match native.event_id.as_deref() {
            Some(raw) => raw
                .parse::<EventId>()
                .map_err(|e| AdapterError::adaptation("event_id", e.to_string()))?,
            None => EventId::new(),
        };

        // A root event starts its own correlation chain.
        let correlation_id = ctx
            .correlation_id
            .map(str::to_string)
            .or_else(|| native.correlation_id.clone())
            .unwrap_or_else(|| event_id.to_string());
        let causation_id = ctx
            .causation_id
            .map(str::to_string)
            .or_else(|| native.causation_id.clone())
            .unwrap_or_default();

        let data = match &native.data {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other.clone(),
        };

        let draft = EnvelopeDraft {
            event_id,
            event_type,
            domain: self.domain.clone(),
            entity_id,
            occurred_at: native.occurred_at.unwrap_or(ctx.now),
            event_version: native.event_version.unwrap_or(1),
            correlation_id,
            causation_id,
            producer: ctx.producer.to_string(),
            data,
        };
        Ok(ctx.registry.seal(draft)?)
    }
}

/// Routes native events to the adapter registered for their domain.
///
/// This is the single entry point producers use.
pub struct AdapterRegistry {
    registry: Arc<Registry>,
    adapters: BTreeMap<String, Box<dyn Adapter>>,
    producer: String,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("domains", &self.adapters.keys().collect::<Vec<_>>())
            .field("producer", &self.producer)
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry; `producer` is stamped on every envelope (`name@version`).
    pub fn new(registry: Arc<Registry>, producer: impl Into<String>) -> Self {
        Self {
            registry,
            adapters: BTreeMap::new(),
            producer: producer.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Registry with adapters for trading, gamification, financial, social, nft and user.
    pub fn standard(registry: Arc<Registry>, producer: impl Into<String>) -> Self {
        let mut adapters = Self::new(registry, producer);
        adapters.register(StandardAdapter::trading());
        adapters.register(StandardAdapter::gamification());
        adapters.register(StandardAdapter::financial());
        adapters.register(StandardAdapter::social());
        adapters.register(StandardAdapter::nft());
        adapters.register(StandardAdapter::user());
        adapters
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register (or replace) the adapter for its domain.
    pub fn register(&mut self, adapter: impl Adapter + 'static) {
        self.adapters
            .insert(adapter.domain().to_ascii_lowercase(), Box::new(adapter));
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Adapt a native event, stamping `occurred_at` from the clock when absent.
    pub fn adapt(
        &self,
        domain: &str,
        native: &NativeEvent,
        correlation_id: Option<&str>,
        causation_id: Option<&str>,
    ) -> Result<EventEnvelope, AdapterError> {
        self.adapt_at(domain, native, correlation_id, causation_id, self.clock.now())
    }

    /// [`adapt`](Self::adapt) with an explicit "now".
    pub fn adapt_at(
        &self,
        domain: &str,
        native: &NativeEvent,
        correlation_id: Option<&str>,
        causation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<EventEnvelope, AdapterError> {
        let key = domain.to_ascii_lowercase();
        let adapter = self
            .adapters
            .get(&key)
            .ok_or_else(|| AdapterError::UnknownDomain(domain.to_string()))?;

        let ctx = AdaptContext {
            registry: &self.registry,
            producer: &self.producer,
            now,
            correlation_id,
            causation_id,
        };
        let envelope = adapter.adapt(native, &ctx)?;
        debug!(
            domain = %key,
            event_type = %envelope.event_type(),
            event_id = %envelope.event_id(),
            "adapted native event"
        );
        Ok(envelope)
    }

    /// Adapt loosely-typed native event data into a wire-shaped envelope.
    pub fn adapt_event_for_streams(
        &self,
        domain: &str,
        native_event_data: &JsonValue,
    ) -> Result<JsonValue, AdapterError> {
        let native: NativeEvent = serde_json::from_value(native_event_data.clone())
            .map_err(|e| AdapterError::adaptation("event", e.to_string()))?;
        let envelope = self.adapt(domain, &native, None, None)?;
        serde_json::to_value(&envelope).map_err(|e| AdapterError::adaptation("event", e.to_string()))
    }
}
