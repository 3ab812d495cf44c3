//! Transactional outbox and its relay.
//!
//! Engine operations append [`OutboxMessage`]s inside their transaction. After the
//! transaction commits, [`OutboxRelay::drain_once`] claims pending messages, maps them
//! to notification calls and hands them to a [`NotificationSink`].
//!
//! Delivery is at-least-once: a message is marked delivered only after the sink
//! accepted it, and the outbox id travels as the idempotency key so the receiving
//! side can drop duplicates. Failed deliveries go back to `pending` until
//! `max_attempts` is reached, then stay `failed` for an operator to inspect.
//! A claim is a lease: a message left `processing` longer than the relay's lease
//! (relay crashed, acknowledgement lost) is claimed again on a later pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use loomerp_core::{OutboxId, UserId};
use loomerp_events::{Event, EventEnvelope};

use crate::notification::{NotificationRequest, NotificationSink};
use crate::store::{ReceivingStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status `{other}`")),
        }
    }
}

/// One domain event waiting for (or done with) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxId,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the current `processing` claim was taken.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set by a claim that took the message over from an expired one.
    #[serde(skip)]
    pub reclaimed: bool,
}

impl OutboxMessage {
    pub fn pending(envelope: EventEnvelope) -> Self {
        Self {
            id: OutboxId::new(),
            created_at: envelope.occurred_at(),
            envelope,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_at: None,
            reclaimed: false,
        }
    }

    /// Wrap a typed domain event.
    pub fn from_event<E>(
        aggregate_type: &str,
        aggregate_id: impl Into<Uuid>,
        actor_id: Option<UserId>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        EventEnvelope::from_typed(aggregate_type, aggregate_id, actor_id, event).map(Self::pending)
    }

    pub fn event_type(&self) -> &str {
        self.envelope.event_type()
    }
}

/// Counters for one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub delivered: usize,
    /// Events with no notification mapping; marked delivered without a call.
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claims taken over from a relay that never finished them.
    pub reclaimed: usize,
    /// Acknowledgements the store refused; the message stays claimed until its lease expires.
    pub unacknowledged: usize,
}

/// How long a claim may stay `processing` before another relay takes it over.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

/// Moves committed outbox messages to the notification collaborator.
pub struct OutboxRelay<S> {
    store: Arc<S>,
    sink: Arc<dyn NotificationSink>,
    batch_size: u32,
    max_attempts: u32,
    lease: Duration,
}

impl<S> OutboxRelay<S>
where
    S: ReceivingStore,
{
    pub fn new(store: Arc<S>, sink: Arc<dyn NotificationSink>, batch_size: u32, max_attempts: u32) -> Self {
        Self {
            store,
            sink,
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Claim one batch and try to deliver every message in it.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let batch = self.store.claim_outbox(self.batch_size, self.lease).await?;
        let mut report = DrainReport {
            claimed: batch.len(),
            ..DrainReport::default()
        };

        for message in batch {
            if message.reclaimed {
                report.reclaimed += 1;
                warn!(
                    outbox_id = %message.id,
                    event_type = message.event_type(),
                    attempts = message.attempts,
                    "reclaimed abandoned outbox message"
                );
            }

            let Some(request) = NotificationRequest::from_envelope(&message.envelope) else {
                if self.acknowledge(&message).await {
                    report.skipped += 1;
                } else {
                    report.unacknowledged += 1;
                }
                continue;
            };

            match self.sink.deliver(message.id, &request).await {
                Ok(()) => {
                    if !self.acknowledge(&message).await {
                        report.unacknowledged += 1;
                        continue;
                    }
                    report.delivered += 1;
                    debug!(
                        outbox_id = %message.id,
                        event_type = message.event_type(),
                        recipient = %request.recipient_department,
                        "outbox message delivered"
                    );
                }
                Err(err) => {
                    let reason = err.to_string();
                    let released = match self
                        .store
                        .release_outbox(message.id, &reason, self.max_attempts)
                        .await
                    {
                        Ok(status) => status,
                        Err(store_err) => {
                            report.unacknowledged += 1;
                            error!(
                                outbox_id = %message.id,
                                error = %store_err,
                                "could not release outbox message; it is retried once its lease expires"
                            );
                            continue;
                        }
                    };
                    match released {
                        OutboxStatus::Failed => {
                            report.failed += 1;
                            error!(
                                outbox_id = %message.id,
                                event_type = message.event_type(),
                                attempts = message.attempts,
                                error = %reason,
                                "outbox message failed permanently"
                            );
                        }
                        _ => {
                            report.retried += 1;
                            warn!(
                                outbox_id = %message.id,
                                event_type = message.event_type(),
                                attempts = message.attempts,
                                error = %reason,
                                "outbox delivery failed; will retry"
                            );
                        }
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                skipped = report.skipped,
                retried = report.retried,
                failed = report.failed,
                reclaimed = report.reclaimed,
                unacknowledged = report.unacknowledged,
                "outbox drained"
            );
        }
        Ok(report)
    }

    /// Mark `message` delivered. A store error is logged and leaves the claim to expire.
    async fn acknowledge(&self, message: &OutboxMessage) -> bool {
        match self.store.mark_delivered(message.id).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    outbox_id = %message.id,
                    event_type = message.event_type(),
                    error = %err,
                    "could not mark outbox message delivered; it is redelivered once its lease expires"
                );
                false
            }
        }
    }

    /// Poll the outbox on a fixed interval until the task is aborted.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.drain_once().await {
                    error!(error = %err, "outbox relay pass failed");
                }
            }
        })
    }
}
