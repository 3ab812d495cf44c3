use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loomerp_core::{
    Aggregate, AggregateRoot, ConflictKind, DomainError, PurchaseOrderId, Quantity, VendorId,
};
use loomerp_events::Event;

/// Purchase order lifecycle status.
///
/// Statuses only move forward (by [`PurchaseOrderStatus::rank`]) except for the
/// explicit `cancelled` / `rejected` exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    PendingApproval,
    Approved,
    Sent,
    GrnRequested,
    PartialReceived,
    Received,
    Completed,
    Cancelled,
    Rejected,
}

impl PurchaseOrderStatus {
    pub const ALL: [PurchaseOrderStatus; 10] = [
        PurchaseOrderStatus::Draft,
        PurchaseOrderStatus::PendingApproval,
        PurchaseOrderStatus::Approved,
        PurchaseOrderStatus::Sent,
        PurchaseOrderStatus::GrnRequested,
        PurchaseOrderStatus::PartialReceived,
        PurchaseOrderStatus::Received,
        PurchaseOrderStatus::Completed,
        PurchaseOrderStatus::Cancelled,
        PurchaseOrderStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::PendingApproval => "pending_approval",
            PurchaseOrderStatus::Approved => "approved",
            PurchaseOrderStatus::Sent => "sent",
            PurchaseOrderStatus::GrnRequested => "grn_requested",
            PurchaseOrderStatus::PartialReceived => "partial_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Completed => "completed",
            PurchaseOrderStatus::Cancelled => "cancelled",
            PurchaseOrderStatus::Rejected => "rejected",
        }
    }

    /// Position on the forward path; `None` for the terminal exits.
    pub fn rank(self) -> Option<u8> {
        match self {
            PurchaseOrderStatus::Draft => Some(0),
            PurchaseOrderStatus::PendingApproval => Some(1),
            PurchaseOrderStatus::Approved => Some(2),
            PurchaseOrderStatus::Sent => Some(3),
            PurchaseOrderStatus::GrnRequested => Some(4),
            PurchaseOrderStatus::PartialReceived => Some(5),
            PurchaseOrderStatus::Received => Some(6),
            PurchaseOrderStatus::Completed => Some(7),
            PurchaseOrderStatus::Cancelled | PurchaseOrderStatus::Rejected => None,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Completed
                | PurchaseOrderStatus::Cancelled
                | PurchaseOrderStatus::Rejected
        )
    }

    /// Whether goods may be received against an order in this status.
    pub fn accepts_receipts(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Approved
                | PurchaseOrderStatus::Sent
                | PurchaseOrderStatus::GrnRequested
                | PurchaseOrderStatus::PartialReceived
        )
    }

    /// `true` when moving to `target` goes strictly forward on the lifecycle.
    pub fn is_forward_to(self, target: PurchaseOrderStatus) -> bool {
        match (self.rank(), target.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PurchaseOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PurchaseOrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation("status", format!("unknown purchase order status `{s}`")))
    }
}

/// Purchase order line (one material at one rate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    pub line_no: u32,
    pub material_name: String,
    pub unit: String,
    pub ordered_quantity: Quantity,
    pub rate: Decimal,
}

/// Line as supplied when the order is created (line numbers are assigned here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseOrderLine {
    pub material_name: String,
    pub unit: String,
    pub ordered_quantity: Quantity,
    pub rate: Decimal,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    po_number: String,
    vendor_id: VendorId,
    vendor_name: String,
    status: PurchaseOrderStatus,
    lines: Vec<PurchaseOrderLine>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            po_number: String::new(),
            vendor_id: VendorId::from_uuid(Uuid::nil()),
            vendor_name: String::new(),
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            version: 0,
            created: false,
        }
    }

    /// Rebuild a persisted purchase order row.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: PurchaseOrderId,
        po_number: String,
        vendor_id: VendorId,
        vendor_name: String,
        status: PurchaseOrderStatus,
        lines: Vec<PurchaseOrderLine>,
        version: u64,
    ) -> Self {
        Self {
            id,
            po_number,
            vendor_id,
            vendor_name,
            status,
            lines,
            version,
            created: true,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn po_number(&self) -> &str {
        &self.po_number
    }

    /// Vendor of the order (nil UUID until created).
    pub fn vendor_id(&self) -> VendorId {
        self.vendor_id
    }

    pub fn vendor_name(&self) -> &str {
        &self.vendor_name
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[PurchaseOrderLine] {
        &self.lines
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn line_for(&self, material_name: &str) -> Option<&PurchaseOrderLine> {
        self.lines
            .iter()
            .find(|line| line.material_name.eq_ignore_ascii_case(material_name.trim()))
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub vendor_id: VendorId,
    pub vendor_name: String,
    pub lines: Vec<NewPurchaseOrderLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    /// Procurement approval (`draft` / `pending_approval` → `approved`).
    Approve { occurred_at: DateTime<Utc> },
    /// Approval for receiving: the order now expects a GRN.
    RequestReceipt { occurred_at: DateTime<Utc> },
    /// Receipt-driven move computed by the status synchronizer.
    ///
    /// Non-forward targets are ignored (no events) so re-syncing is harmless.
    AdvanceFromReceipts {
        target: PurchaseOrderStatus,
        occurred_at: DateTime<Utc>,
    },
    /// Downstream fulfillment finished (`received` → `completed`).
    MarkFulfilled { occurred_at: DateTime<Utc> },
    Cancel {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub vendor_id: VendorId,
    pub vendor_name: String,
    pub lines: Vec<PurchaseOrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderStatusChanged {
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub from: PurchaseOrderStatus,
    pub to: PurchaseOrderStatus,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderStatusChanged(PurchaseOrderStatusChanged),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderStatusChanged(_) => "purchasing.order.status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.po_number = e.po_number.clone();
                self.vendor_id = e.vendor_id;
                self.vendor_name = e.vendor_name.clone();
                self.status = PurchaseOrderStatus::Draft;
                self.lines = e.lines.clone();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderStatusChanged(e) => {
                self.status = e.to;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::Approve { occurred_at } => {
                self.ensure_created()?;
                if !matches!(
                    self.status,
                    PurchaseOrderStatus::Draft | PurchaseOrderStatus::PendingApproval
                ) {
                    return Err(self.invalid_transition(PurchaseOrderStatus::Approved));
                }
                Ok(vec![self.status_changed(PurchaseOrderStatus::Approved, None, *occurred_at)])
            }
            PurchaseOrderCommand::RequestReceipt { occurred_at } => {
                self.ensure_created()?;
                if !self.status.accepts_receipts() {
                    return Err(self.invalid_transition(PurchaseOrderStatus::GrnRequested));
                }
                if !self.status.is_forward_to(PurchaseOrderStatus::GrnRequested) {
                    return Ok(vec![]);
                }
                Ok(vec![self.status_changed(
                    PurchaseOrderStatus::GrnRequested,
                    Some("approved for receiving".to_string()),
                    *occurred_at,
                )])
            }
            PurchaseOrderCommand::AdvanceFromReceipts { target, occurred_at } => {
                self.ensure_created()?;
                if !matches!(
                    target,
                    PurchaseOrderStatus::PartialReceived | PurchaseOrderStatus::Received
                ) {
                    return Err(DomainError::validation(
                        "target",
                        format!("receipts cannot move an order to `{target}`"),
                    ));
                }
                if !self.status.is_forward_to(*target) {
                    return Ok(vec![]);
                }
                Ok(vec![self.status_changed(
                    *target,
                    Some("goods receipt reconciliation".to_string()),
                    *occurred_at,
                )])
            }
            PurchaseOrderCommand::MarkFulfilled { occurred_at } => {
                self.ensure_created()?;
                if self.status != PurchaseOrderStatus::Received {
                    return Err(self.invalid_transition(PurchaseOrderStatus::Completed));
                }
                Ok(vec![self.status_changed(PurchaseOrderStatus::Completed, None, *occurred_at)])
            }
            PurchaseOrderCommand::Cancel { reason, occurred_at } => {
                self.ensure_created()?;
                if self.status.is_closed() || self.status == PurchaseOrderStatus::Received {
                    return Err(self.invalid_transition(PurchaseOrderStatus::Cancelled));
                }
                if reason.trim().is_empty() {
                    return Err(DomainError::validation("reason", "cancellation needs a reason"));
                }
                Ok(vec![self.status_changed(
                    PurchaseOrderStatus::Cancelled,
                    Some(reason.trim().to_string()),
                    *occurred_at,
                )])
            }
        }
    }
}

impl PurchaseOrder {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found("purchase_order", self.id));
        }
        Ok(())
    }

    fn status_changed(
        &self,
        to: PurchaseOrderStatus,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> PurchaseOrderEvent {
        PurchaseOrderEvent::PurchaseOrderStatusChanged(PurchaseOrderStatusChanged {
            order_id: self.id,
            po_number: self.po_number.clone(),
            from: self.status,
            to,
            reason,
            occurred_at,
        })
    }

    fn invalid_transition(&self, to: PurchaseOrderStatus) -> DomainError {
        DomainError::conflict(
            ConflictKind::InvalidTransition,
            format!(
                "purchase order {} cannot move from `{}` to `{to}`",
                self.po_number, self.status
            ),
        )
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(
                ConflictKind::InvalidTransition,
                "purchase order already exists",
            ));
        }
        if cmd.order_id != self.id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        if cmd.po_number.trim().is_empty() {
            return Err(DomainError::validation("po_number", "must not be empty"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("lines", "purchase order needs at least one line"));
        }

        let mut seen = HashSet::new();
        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, line) in cmd.lines.iter().enumerate() {
            let prefix = format!("lines[{idx}]");
            let material = line.material_name.trim();
            if material.is_empty() {
                return Err(DomainError::validation("material_name", "must not be empty").within(&prefix));
            }
            if !seen.insert(material.to_ascii_lowercase()) {
                return Err(DomainError::validation(
                    "material_name",
                    format!("material `{material}` appears more than once"),
                )
                .within(&prefix));
            }
            if line.ordered_quantity.is_zero() {
                return Err(DomainError::invalid_quantity("ordered_quantity", "must be positive").within(&prefix));
            }
            if line.rate < Decimal::ZERO {
                return Err(DomainError::validation("rate", "must not be negative").within(&prefix));
            }
            lines.push(PurchaseOrderLine {
                line_no: idx as u32 + 1,
                material_name: material.to_string(),
                unit: line.unit.trim().to_string(),
                ordered_quantity: line.ordered_quantity,
                rate: line.rate,
            });
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(PurchaseOrderCreated {
            order_id: cmd.order_id,
            po_number: cmd.po_number.trim().to_string(),
            vendor_id: cmd.vendor_id,
            vendor_name: cmd.vendor_name.trim().to_string(),
            lines,
            occurred_at: cmd.occurred_at,
        })])
    }
}
