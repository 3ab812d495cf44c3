//! Notification collaborator: request shape, event mapping and sinks.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use loomerp_core::{OutboxId, UserId};
use loomerp_events::EventEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// "Deliver to department/user" call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient_department: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub related_entity_id: Uuid,
    pub related_entity_type: String,
    pub trigger_event: String,
    pub actor_id: Option<UserId>,
    pub metadata: JsonValue,
}

impl NotificationRequest {
    /// Map a committed domain event to the call it triggers, if any.
    pub fn from_envelope(envelope: &EventEnvelope) -> Option<Self> {
        let grn_number = text(envelope, "grn_number");
        let (department, priority, title, message) = match envelope.event_type() {
            "receiving.grn.opened" => (
                "store",
                NotificationPriority::Medium,
                "GRN ready for counting".to_string(),
                format!("GRN {grn_number} is waiting for physical counts"),
            ),
            "receiving.grn.counts_recorded" | "receiving.grn.verified" => {
                match text(envelope, "verification_status").as_str() {
                    "discrepancy" => (
                        "procurement",
                        NotificationPriority::High,
                        "GRN discrepancy".to_string(),
                        format!("GRN {grn_number} does not match the supplier invoice"),
                    ),
                    "verified" => (
                        "inventory",
                        NotificationPriority::Medium,
                        "GRN verified".to_string(),
                        format!("GRN {grn_number} matches the supplier invoice"),
                    ),
                    _ => return None,
                }
            }
            "receiving.grn.cancelled" => (
                "store",
                NotificationPriority::Low,
                "GRN cancelled".to_string(),
                format!("GRN {grn_number} was cancelled: {}", text(envelope, "reason")),
            ),
            "receiving.grn.deleted" => (
                "store",
                NotificationPriority::Low,
                "GRN deleted".to_string(),
                format!("GRN {grn_number} was deleted"),
            ),
            "returns.vendor_return.raised" => (
                "procurement",
                NotificationPriority::High,
                "Shortage claim raised".to_string(),
                format!(
                    "Vendor return {} raised for a shortage worth {}",
                    text(envelope, "return_number"),
                    text(envelope, "total_shortage_value")
                ),
            ),
            "returns.vendor_return.updated" => (
                "procurement",
                NotificationPriority::Low,
                "Shortage claim updated".to_string(),
                format!(
                    "Vendor return {} now totals {}",
                    text(envelope, "return_number"),
                    text(envelope, "total_shortage_value")
                ),
            ),
            "inventory.grn.materialized" => (
                "inventory",
                NotificationPriority::Medium,
                "Stock received".to_string(),
                format!("Stock from GRN {grn_number} is on the books"),
            ),
            "purchasing.order.status_changed" => (
                "procurement",
                NotificationPriority::Medium,
                "Purchase order status changed".to_string(),
                format!(
                    "Purchase order {} moved from {} to {}",
                    text(envelope, "po_number"),
                    text(envelope, "from"),
                    text(envelope, "to")
                ),
            ),
            _ => return None,
        };

        Some(Self {
            recipient_department: department.to_string(),
            title,
            message,
            priority,
            related_entity_id: envelope.aggregate_id(),
            related_entity_type: envelope.aggregate_type().to_string(),
            trigger_event: envelope.event_type().to_string(),
            actor_id: envelope.actor_id(),
            metadata: json!({
                "event_id": envelope.event_id(),
                "occurred_at": envelope.occurred_at(),
                "payload": envelope.payload(),
            }),
        })
    }
}

fn text(envelope: &EventEnvelope, field: &str) -> String {
    match envelope.payload_field(field) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for notification calls.
///
/// Implementations should treat `idempotency_key` as the dedupe key; the relay
/// may deliver the same message more than once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        idempotency_key: OutboxId,
        request: &NotificationRequest,
    ) -> Result<(), NotificationError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn deliver(
        &self,
        idempotency_key: OutboxId,
        request: &NotificationRequest,
    ) -> Result<(), NotificationError> {
        info!(
            idempotency_key = %idempotency_key,
            recipient = %request.recipient_department,
            trigger_event = %request.trigger_event,
            title = %request.title,
            "notification"
        );
        Ok(())
    }
}

/// Records delivered notifications; can be told to fail the next calls.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    delivered: Mutex<Vec<(OutboxId, NotificationRequest)>>,
    failures_remaining: AtomicU32,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` deliveries fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<(OutboxId, NotificationRequest)> {
        self.delivered
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn deliver(
        &self,
        idempotency_key: OutboxId,
        request: &NotificationRequest,
    ) -> Result<(), NotificationError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotificationError::Transport("injected delivery failure".to_string()));
        }

        let mut delivered = self
            .delivered
            .lock()
            .map_err(|_| NotificationError::Transport("lock poisoned".to_string()))?;
        if !delivered.iter().any(|(key, _)| *key == idempotency_key) {
            delivered.push((idempotency_key, request.clone()));
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct HttpNotificationSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotificationSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(
        &self,
        idempotency_key: OutboxId,
        request: &NotificationRequest,
    ) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", idempotency_key.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotificationError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
