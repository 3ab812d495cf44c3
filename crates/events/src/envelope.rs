use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use loomerp_core::UserId;

use crate::event::Event;

/// Envelope for a domain event, carrying the metadata the outbox and the
/// notification mapping need without knowing the concrete event type.
///
/// Notes:
/// - `aggregate_id` is the raw id of the row the event is about (GRN, PO, claim).
/// - `payload` is the serialized typed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,

    aggregate_id: Uuid,
    aggregate_type: String,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    actor_id: Option<UserId>,

    payload: JsonValue,
}

impl EventEnvelope {
    /// Wrap a typed event, capturing its metadata and serializing the payload.
    pub fn from_typed<E>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<Uuid>,
        actor_id: Option<UserId>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            actor_id,
            payload: serde_json::to_value(event)?,
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn actor_id(&self) -> Option<UserId> {
        self.actor_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Look up a top-level string field of the payload's inner event body.
    ///
    /// Typed events serialize as `{ "VariantName": { ...fields } }`; this reaches
    /// through the variant wrapper.
    pub fn payload_field(&self, field: &str) -> Option<&JsonValue> {
        match &self.payload {
            JsonValue::Object(map) if map.len() == 1 => map
                .values()
                .next()
                .and_then(|inner| inner.get(field)),
            other => other.get(field),
        }
    }
}
