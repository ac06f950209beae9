//! Event schema & registry.
//!
//! The [`Registry`] is the single source of truth for which event types exist, which
//! domain owns each of them, and how an envelope is validated before it leaves the
//! process. It is built once at start-up and shared by reference (`Arc<Registry>`).
//!
//! ## Stream naming
//!
//! One logical stream per `(domain, event_type, major_version)`:
//!
//! ```text
//! astra.<domain>.<action_lowercased>.v<version>
//! Trading.TradeExecuted v1  ->  astra.trading.tradeexecuted.v1
//! ```
//!
//! [`stream_name`] is a pure function so ad-hoc tooling can derive names without a lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use astra_core::EventId;

use crate::envelope::{EnvelopeDraft, EventEnvelope};
use crate::error::SchemaValidationError;

/// Prefix shared by every stream key.
pub const STREAM_PREFIX: &str = "astra";

static EVENT_TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Za-z0-9]*\.[A-Z][A-Za-z0-9]*$").expect("event type pattern is valid")
});

/// Derive the stream name for `(domain, event_type, version)`.
///
/// `event_type` may be qualified (`Trading.TradeExecuted`) or bare (`TradeExecuted`);
/// only the action segment contributes to the name.
pub fn stream_name(domain: &str, event_type: &str, version: u32) -> String {
    let action = event_type.rsplit('.').next().unwrap_or(event_type);
    format!(
        "{STREAM_PREFIX}.{}.{}.v{version}",
        domain.to_ascii_lowercase(),
        action.to_ascii_lowercase()
    )
}

/// Whether `event_type` has the `<Domain>.<Action>` shape.
pub fn is_well_formed_event_type(event_type: &str) -> bool {
    EVENT_TYPE_PATTERN.is_match(event_type)
}

/// One domain and the event types it may emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    name: String,
    prefix: String,
    event_types: BTreeSet<String>,
}

impl DomainSpec {
    /// Lowercase domain name (e.g. `nft`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical `event_type` prefix (e.g. `NFT`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Qualified event types, sorted.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.event_types.iter().map(String::as_str)
    }
}

/// Registry of event types and envelope validator.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    domains: BTreeMap<String, DomainSpec>,
    owners: HashMap<String, String>,
}

impl Registry {
    /// Empty registry; populate with [`Registry::register_domain`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the platform's six domains and their event catalogue.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for (name, prefix, actions) in STANDARD_CATALOGUE {
            registry.insert(name, prefix, actions.iter().copied());
        }
        registry
    }

    /// Register (or extend) a domain with bare action names.
    ///
    /// Fails if the prefix/action combination does not form a well-formed event type,
    /// or if the prefix does not agree with the domain name.
    pub fn register_domain<'a>(
        &mut self,
        name: &str,
        prefix: &str,
        actions: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), SchemaValidationError> {
        if name.is_empty() {
            return Err(SchemaValidationError::new("domain", "must not be empty"));
        }
        if !name.eq_ignore_ascii_case(prefix) {
            return Err(SchemaValidationError::new(
                "domain",
                format!("prefix `{prefix}` does not match domain `{name}`"),
            ));
        }
        let actions: Vec<&str> = actions.into_iter().collect();
        for action in &actions {
            let qualified = format!("{prefix}.{action}");
            if !is_well_formed_event_type(&qualified) {
                return Err(SchemaValidationError::new(
                    "event_type",
                    format!("`{qualified}` is not of the form <Domain>.<Action>"),
                ));
            }
        }
        self.insert(name, prefix, actions);
        Ok(())
    }

    fn insert<'a>(&mut self, name: &str, prefix: &str, actions: impl IntoIterator<Item = &'a str>) {
        let name = name.to_ascii_lowercase();
        let spec = self.domains.entry(name.clone()).or_insert_with(|| DomainSpec {
            name: name.clone(),
            prefix: prefix.to_string(),
            event_types: BTreeSet::new(),
        });
        for action in actions {
            let qualified = format!("{}.{action}", spec.prefix);
            self.owners.insert(qualified.clone(), name.clone());
            spec.event_types.insert(qualified);
        }
    }

    pub fn domain(&self, name: &str) -> Option<&DomainSpec> {
        self.domains.get(&name.to_ascii_lowercase())
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainSpec> {
        self.domains.values()
    }

    /// Membership check used by adapters to fail fast on typos.
    pub fn is_valid_event_type(&self, event_type: &str) -> bool {
        self.owners.contains_key(event_type)
    }

    /// Domain owning a qualified event type.
    pub fn domain_of(&self, event_type: &str) -> Option<&str> {
        self.owners.get(event_type).map(String::as_str)
    }

    /// Qualify a bare action with the domain's canonical prefix.
    ///
    /// Already-qualified names are returned unchanged. Returns `None` for unknown domains.
    pub fn qualify(&self, domain: &str, event_type: &str) -> Option<String> {
        let spec = self.domain(domain)?;
        if event_type.contains('.') {
            Some(event_type.to_string())
        } else {
            Some(format!("{}.{event_type}", spec.prefix))
        }
    }

    /// Event types of a domain, sorted. Empty for unknown domains.
    pub fn events_for_domain(&self, domain: &str) -> Vec<&str> {
        self.domain(domain)
            .map(|spec| spec.event_types().collect())
            .unwrap_or_default()
    }

    /// Stream name for a registered event type.
    pub fn stream_name_for(
        &self,
        event_type: &str,
        version: u32,
    ) -> Result<String, SchemaValidationError> {
        let domain = self.domain_of(event_type).ok_or_else(|| {
            SchemaValidationError::new("event_type", format!("unknown event type `{event_type}`"))
        })?;
        if version < 1 {
            return Err(SchemaValidationError::new("event_version", "must be >= 1"));
        }
        Ok(stream_name(domain, event_type, version))
    }

    /// All v1 stream names, for ops tooling.
    pub fn all_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .owners
            .iter()
            .map(|(event_type, domain)| stream_name(domain, event_type, 1))
            .collect();
        streams.sort();
        streams
    }

    /// Validate a wire-shaped envelope candidate.
    ///
    /// Every violation names the offending field. Unknown top-level fields are kept as
    /// extensions.
    ///
    /// A candidate whose `data` is already an object or array comes back unchanged. A
    /// `data` string holding encoded JSON is the one normalization: it is returned
    /// decoded, so the envelope re-encodes with structured `data` and validating that
    /// output again yields the same envelope.
    pub fn validate(&self, candidate: &JsonValue) -> Result<EventEnvelope, SchemaValidationError> {
        let mut fields = candidate
            .as_object()
            .cloned()
            .ok_or_else(|| SchemaValidationError::new("envelope", "must be a JSON object"))?;

        let event_id = take_str(&mut fields, "event_id")?
            .parse::<EventId>()
            .map_err(|e| SchemaValidationError::new("event_id", e.to_string()))?;
        let event_type = take_str(&mut fields, "event_type")?;
        let domain = take_str(&mut fields, "domain")?;
        let entity_id = take_str(&mut fields, "entity_id")?;
        let occurred_at = parse_utc(&take_str(&mut fields, "occurred_at")?)?;
        let event_version = take_version(&mut fields)?;
        let correlation_id = take_optional_str(&mut fields, "correlation_id")?;
        let causation_id = take_optional_str(&mut fields, "causation_id")?;
        let producer = take_str(&mut fields, "producer")?;
        let data = decode_data(
            fields
                .remove("data")
                .ok_or_else(|| SchemaValidationError::new("data", "is required"))?,
        )?;

        let envelope = EventEnvelope::from_parts(
            EnvelopeDraft {
                event_id,
                event_type,
                domain,
                entity_id,
                occurred_at,
                event_version,
                correlation_id,
                causation_id,
                producer,
                data,
            },
            fields,
        );
        self.validate_envelope(&envelope)?;
        Ok(envelope)
    }

    /// Validate an adapter-built draft and seal it into an envelope.
    pub fn seal(&self, draft: EnvelopeDraft) -> Result<EventEnvelope, SchemaValidationError> {
        let envelope = EventEnvelope::from_parts(draft, Map::new());
        self.validate_envelope(&envelope)?;
        Ok(envelope)
    }

    /// Re-check a typed envelope (e.g. one decoded from a stream) against the registry.
    pub fn validate_envelope(&self, envelope: &EventEnvelope) -> Result<(), SchemaValidationError> {
        if envelope.event_id().as_uuid().is_nil() {
            return Err(SchemaValidationError::new("event_id", "must not be nil"));
        }

        let event_type = envelope.event_type();
        if !is_well_formed_event_type(event_type) {
            return Err(SchemaValidationError::new(
                "event_type",
                format!("`{event_type}` is not of the form <Domain>.<Action>"),
            ));
        }
        let owner = self.domain_of(event_type).ok_or_else(|| {
            SchemaValidationError::new("event_type", format!("unknown event type `{event_type}`"))
        })?;

        let domain = envelope.domain();
        if domain.is_empty() {
            return Err(SchemaValidationError::new("domain", "must not be empty"));
        }
        let prefix = event_type.split('.').next().unwrap_or_default();
        if !domain.eq_ignore_ascii_case(prefix) || !domain.eq_ignore_ascii_case(owner) {
            return Err(SchemaValidationError::new(
                "domain",
                format!("`{domain}` does not own `{event_type}`"),
            ));
        }

        if envelope.entity_id().is_empty() {
            return Err(SchemaValidationError::new("entity_id", "must not be empty"));
        }
        if envelope.event_version() < 1 {
            return Err(SchemaValidationError::new("event_version", "must be >= 1"));
        }
        if envelope.producer().is_empty() {
            return Err(SchemaValidationError::new("producer", "must not be empty"));
        }
        if !is_structured(envelope.data()) {
            return Err(SchemaValidationError::new(
                "data",
                "must be a JSON object or array",
            ));
        }
        Ok(())
    }
}

const STANDARD_CATALOGUE: &[(&str, &str, &[&str])] = &[
    (
        "trading",
        "Trading",
        &[
            "TradeExecuted",
            "OrderPlaced",
            "OrderCancelled",
            "PositionOpened",
            "PositionClosed",
        ],
    ),
    (
        "gamification",
        "Gamification",
        &[
            "XPGained",
            "LevelUp",
            "AchievementUnlocked",
            "QuestCompleted",
            "StreakUpdated",
        ],
    ),
    (
        "financial",
        "Financial",
        &[
            "PaymentProcessed",
            "WalletCredited",
            "WalletDebited",
            "SubscriptionChanged",
        ],
    ),
    (
        "social",
        "Social",
        &["PostCreated", "CommentAdded", "FollowerGained", "ReactionAdded"],
    ),
    ("nft", "NFT", &["NFTMinted", "NFTTransferred", "NFTListed"]),
    (
        "user",
        "User",
        &["UserRegistered", "UserProfileUpdated", "UserLoggedIn"],
    ),
];

fn take_str(
    fields: &mut Map<String, JsonValue>,
    field: &'static str,
) -> Result<String, SchemaValidationError> {
    match fields.remove(field) {
        Some(JsonValue::String(s)) => Ok(s),
        Some(other) => Err(SchemaValidationError::new(
            field,
            format!("expected a string, got {other}"),
        )),
        None => Err(SchemaValidationError::new(field, "is required")),
    }
}

fn take_optional_str(
    fields: &mut Map<String, JsonValue>,
    field: &'static str,
) -> Result<String, SchemaValidationError> {
    match fields.remove(field) {
        Some(JsonValue::String(s)) => Ok(s),
        None | Some(JsonValue::Null) => Ok(String::new()),
        Some(other) => Err(SchemaValidationError::new(
            field,
            format!("expected a string, got {other}"),
        )),
    }
}

fn take_version(fields: &mut Map<String, JsonValue>) -> Result<u32, SchemaValidationError> {
    let raw = fields
        .remove("event_version")
        .ok_or_else(|| SchemaValidationError::new("event_version", "is required"))?;
    raw.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v >= 1)
        .ok_or_else(|| {
            SchemaValidationError::new("event_version", format!("must be an integer >= 1, got {raw}"))
        })
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>, SchemaValidationError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| SchemaValidationError::new("occurred_at", format!("`{raw}`: {e}")))?;
    if parsed.offset().local_minus_utc() != 0 {
        return Err(SchemaValidationError::new(
            "occurred_at",
            format!("`{raw}` is not in UTC"),
        ));
    }
    Ok(parsed.with_timezone(&Utc))
}

fn is_structured(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Object(_) | JsonValue::Array(_))
}

/// Accept structured data, or a string that decodes to structured data.
fn decode_data(value: JsonValue) -> Result<JsonValue, SchemaValidationError> {
    match value {
        JsonValue::String(raw) => {
            let decoded: JsonValue = serde_json::from_str(&raw)
                .map_err(|e| SchemaValidationError::new("data", format!("does not decode: {e}")))?;
            if is_structured(&decoded) {
                Ok(decoded)
            } else {
                Err(SchemaValidationError::new("data", "must decode to an object or array"))
            }
        }
        other if is_structured(&other) => Ok(other),
        other => Err(SchemaValidationError::new(
            "data",
            format!("must be an object or array, got {other}"),
        )),
    }
}
