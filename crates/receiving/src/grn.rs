use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loomerp_core::{
    Aggregate, AggregateRoot, ConflictKind, DomainError, DomainResult, Entity, GrnId,
    PurchaseOrderId, UserId, VendorId,
};
use loomerp_events::Event;

use crate::line::ReceiptLine;

/// Verification state machine: `pending → verified | discrepancy`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Discrepancy,
    Verified,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Discrepancy => "discrepancy",
            VerificationStatus::Verified => "verified",
        }
    }
}

impl core::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for VerificationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "discrepancy" => Ok(VerificationStatus::Discrepancy),
            "verified" => Ok(VerificationStatus::Verified),
            other => Err(DomainError::validation(
                "verification_status",
                format!("unknown verification status `{other}`"),
            )),
        }
    }
}

/// Document status of a GRN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrnStatus {
    Draft,
    Received,
    Completed,
    Cancelled,
}

impl GrnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GrnStatus::Draft => "draft",
            GrnStatus::Received => "received",
            GrnStatus::Completed => "completed",
            GrnStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for GrnStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for GrnStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(GrnStatus::Draft),
            "received" => Ok(GrnStatus::Received),
            "completed" => Ok(GrnStatus::Completed),
            "cancelled" => Ok(GrnStatus::Cancelled),
            other => Err(DomainError::validation("status", format!("unknown GRN status `{other}`"))),
        }
    }
}

/// `GRN-{po_number}-{sequence:02}`
pub fn grn_number_for(po_number: &str, sequence: u32) -> String {
    format!("GRN-{po_number}-{sequence:02}")
}

/// Persisted shape of a goods receipt note.
///
/// Stores read and write this; the aggregate wraps it to enforce transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnRecord {
    pub id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub vendor_id: VendorId,
    pub supplier_name: String,
    pub grn_sequence: u32,
    pub is_first_grn: bool,
    pub original_grn_id: Option<GrnId>,
    pub items_received: Vec<ReceiptLine>,
    pub verification_status: VerificationStatus,
    pub status: GrnStatus,
    pub inventory_added: bool,
    pub remarks: Option<String>,
    pub cancellation_reason: Option<String>,
    pub received_by: Option<UserId>,
    pub reviewed_by: Option<UserId>,
    pub received_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Aggregate root: GoodsReceiptNote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodsReceiptNote {
    record: GrnRecord,
    created: bool,
}

impl GoodsReceiptNote {
    /// Create an empty, not-yet-opened aggregate instance.
    pub fn empty(id: GrnId) -> Self {
        Self {
            record: GrnRecord {
                id,
                grn_number: String::new(),
                purchase_order_id: PurchaseOrderId::from_uuid(Uuid::nil()),
                vendor_id: VendorId::from_uuid(Uuid::nil()),
                supplier_name: String::new(),
                grn_sequence: 0,
                is_first_grn: false,
                original_grn_id: None,
                items_received: Vec::new(),
                verification_status: VerificationStatus::Pending,
                status: GrnStatus::Draft,
                inventory_added: false,
                remarks: None,
                cancellation_reason: None,
                received_by: None,
                reviewed_by: None,
                received_at: DateTime::<Utc>::default(),
                verified_at: None,
                version: 0,
            },
            created: false,
        }
    }

    /// Rebuild a persisted GRN, checking every line still reconciles.
    pub fn restore(record: GrnRecord) -> DomainResult<Self> {
        for (idx, line) in record.items_received.iter().enumerate() {
            line.validate()
                .map_err(|e| e.within(&format!("items_received[{idx}]")))?;
        }
        Ok(Self { record, created: true })
    }

    pub fn record(&self) -> &GrnRecord {
        &self.record
    }

    pub fn into_record(self) -> GrnRecord {
        self.record
    }

    pub fn id_typed(&self) -> GrnId {
        self.record.id
    }

    pub fn grn_number(&self) -> &str {
        &self.record.grn_number
    }

    pub fn purchase_order_id(&self) -> PurchaseOrderId {
        self.record.purchase_order_id
    }

    pub fn vendor_id(&self) -> VendorId {
        self.record.vendor_id
    }

    pub fn supplier_name(&self) -> &str {
        &self.record.supplier_name
    }

    pub fn grn_sequence(&self) -> u32 {
        self.record.grn_sequence
    }

    pub fn is_first_grn(&self) -> bool {
        self.record.is_first_grn
    }

    pub fn original_grn_id(&self) -> Option<GrnId> {
        self.record.original_grn_id
    }

    pub fn items(&self) -> &[ReceiptLine] {
        &self.record.items_received
    }

    pub fn verification_status(&self) -> VerificationStatus {
        self.record.verification_status
    }

    pub fn status(&self) -> GrnStatus {
        self.record.status
    }

    pub fn inventory_added(&self) -> bool {
        self.record.inventory_added
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_cancelled(&self) -> bool {
        self.record.status == GrnStatus::Cancelled
    }

    /// Counts have been decided (verified or discrepancy) and the GRN is live.
    pub fn is_reconciled(&self) -> bool {
        !self.is_cancelled() && self.record.verification_status != VerificationStatus::Pending
    }

    pub fn shortage_lines(&self) -> impl Iterator<Item = &ReceiptLine> {
        self.record.items_received.iter().filter(|l| l.has_shortage())
    }

    pub fn line_for(&self, material_name: &str) -> Option<&ReceiptLine> {
        self.record
            .items_received
            .iter()
            .find(|l| l.material_name.eq_ignore_ascii_case(material_name.trim()))
    }
}

impl AggregateRoot for GoodsReceiptNote {
    type Id = GrnId;

    fn id(&self) -> &Self::Id {
        &self.record.id
    }

    fn version(&self) -> u64 {
        self.record.version
    }
}

impl Entity for GoodsReceiptNote {
    type Id = GrnId;

    fn entity_id(&self) -> GrnId {
        self.record.id
    }
}

impl Serialize for GoodsReceiptNote {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

/// Command: OpenGrn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGrn {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub vendor_id: VendorId,
    pub supplier_name: String,
    pub grn_sequence: u32,
    pub original_grn_id: Option<GrnId>,
    pub items: Vec<ReceiptLine>,
    pub remarks: Option<String>,
    pub opened_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Physical count for one material, as entered from the supplier invoice and the scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCount {
    pub material_name: String,
    pub invoiced_quantity: Decimal,
    pub received_quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrnCommand {
    Open(OpenGrn),
    /// Overwrite counts for every line and decide verification from the result.
    RecordCounts {
        counts: Vec<LineCount>,
        recorded_by: Option<UserId>,
        occurred_at: DateTime<Utc>,
    },
    /// Reviewer decision on a GRN whose counts were never entered.
    Verify {
        requested: VerificationStatus,
        reviewer: Option<UserId>,
        occurred_at: DateTime<Utc>,
    },
    MarkMaterialized { occurred_at: DateTime<Utc> },
    Cancel {
        reason: String,
        cancelled_by: Option<UserId>,
        occurred_at: DateTime<Utc>,
    },
    Delete {
        deleted_by: Option<UserId>,
        occurred_at: DateTime<Utc>,
    },
}

/// Event: GrnOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnOpened {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub vendor_id: VendorId,
    pub supplier_name: String,
    pub grn_sequence: u32,
    pub is_first_grn: bool,
    pub original_grn_id: Option<GrnId>,
    pub items: Vec<ReceiptLine>,
    pub remarks: Option<String>,
    pub opened_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GrnCountsRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnCountsRecorded {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub items: Vec<ReceiptLine>,
    pub verification_status: VerificationStatus,
    pub recorded_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GrnVerified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnVerified {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub items: Vec<ReceiptLine>,
    pub verification_status: VerificationStatus,
    pub reviewer: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GrnInventoryAdded (idempotency flag flipped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnInventoryAdded {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GrnCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnCancelled {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub reason: String,
    pub cancelled_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GrnDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnDeleted {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub was_first_grn: bool,
    pub deleted_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrnEvent {
    GrnOpened(GrnOpened),
    GrnCountsRecorded(GrnCountsRecorded),
    GrnVerified(GrnVerified),
    GrnInventoryAdded(GrnInventoryAdded),
    GrnCancelled(GrnCancelled),
    GrnDeleted(GrnDeleted),
}

impl Event for GrnEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GrnEvent::GrnOpened(_) => "receiving.grn.opened",
            GrnEvent::GrnCountsRecorded(_) => "receiving.grn.counts_recorded",
            GrnEvent::GrnVerified(_) => "receiving.grn.verified",
            GrnEvent::GrnInventoryAdded(_) => "receiving.grn.inventory_added",
            GrnEvent::GrnCancelled(_) => "receiving.grn.cancelled",
            GrnEvent::GrnDeleted(_) => "receiving.grn.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GrnEvent::GrnOpened(e) => e.occurred_at,
            GrnEvent::GrnCountsRecorded(e) => e.occurred_at,
            GrnEvent::GrnVerified(e) => e.occurred_at,
            GrnEvent::GrnInventoryAdded(e) => e.occurred_at,
            GrnEvent::GrnCancelled(e) => e.occurred_at,
            GrnEvent::GrnDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for GoodsReceiptNote {
    type Command = GrnCommand;
    type Event = GrnEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let r = &mut self.record;
        match event {
            GrnEvent::GrnOpened(e) => {
                r.id = e.grn_id;
                r.grn_number = e.grn_number.clone();
                r.purchase_order_id = e.purchase_order_id;
                r.vendor_id = e.vendor_id;
                r.supplier_name = e.supplier_name.clone();
                r.grn_sequence = e.grn_sequence;
                r.is_first_grn = e.is_first_grn;
                r.original_grn_id = e.original_grn_id;
                r.items_received = e.items.clone();
                r.verification_status = VerificationStatus::Pending;
                r.status = GrnStatus::Draft;
                r.inventory_added = false;
                r.remarks = e.remarks.clone();
                r.received_by = e.opened_by;
                r.received_at = e.occurred_at;
                self.created = true;
            }
            GrnEvent::GrnCountsRecorded(e) => {
                r.items_received = e.items.clone();
                r.verification_status = e.verification_status;
                r.status = GrnStatus::Received;
                r.received_by = e.recorded_by.or(r.received_by);
                r.verified_at = Some(e.occurred_at);
            }
            GrnEvent::GrnVerified(e) => {
                r.items_received = e.items.clone();
                r.verification_status = e.verification_status;
                if r.status == GrnStatus::Draft {
                    r.status = GrnStatus::Received;
                }
                r.reviewed_by = e.reviewer;
                r.verified_at = Some(e.occurred_at);
            }
            GrnEvent::GrnInventoryAdded(_) => {
                r.inventory_added = true;
                r.status = GrnStatus::Completed;
            }
            GrnEvent::GrnCancelled(e) => {
                r.status = GrnStatus::Cancelled;
                r.cancellation_reason = Some(e.reason.clone());
            }
            GrnEvent::GrnDeleted(_) => {}
        }

        r.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            GrnCommand::Open(cmd) => self.handle_open(cmd),
            GrnCommand::RecordCounts {
                counts,
                recorded_by,
                occurred_at,
            } => {
                self.ensure_created()?;
                self.ensure_open_for_counts()?;
                let items = self.recount(counts)?;
                let verification_status = if items.iter().any(|l| l.discrepancy_flag) {
                    VerificationStatus::Discrepancy
                } else {
                    VerificationStatus::Verified
                };
                Ok(vec![GrnEvent::GrnCountsRecorded(GrnCountsRecorded {
                    grn_id: self.record.id,
                    grn_number: self.record.grn_number.clone(),
                    purchase_order_id: self.record.purchase_order_id,
                    items,
                    verification_status,
                    recorded_by: *recorded_by,
                    occurred_at: *occurred_at,
                })])
            }
            GrnCommand::Verify {
                requested,
                reviewer,
                occurred_at,
            } => {
                self.ensure_created()?;
                if self.is_cancelled() {
                    return Err(self.invalid_transition("verify"));
                }
                self.ensure_pending()?;
                let items = self
                    .record
                    .items_received
                    .iter()
                    .enumerate()
                    .map(|(idx, l)| l.reconciled().map_err(|e| e.within(&format!("items[{idx}]"))))
                    .collect::<DomainResult<Vec<_>>>()?;
                match requested {
                    VerificationStatus::Pending => {
                        return Err(DomainError::validation(
                            "verification_status",
                            "must be `verified` or `discrepancy`",
                        ));
                    }
                    VerificationStatus::Verified => {
                        if let Some(line) = items.iter().find(|l| l.discrepancy_flag) {
                            return Err(DomainError::validation(
                                "verification_status",
                                format!(
                                    "cannot verify: `{}` has a {} discrepancy",
                                    line.material_name,
                                    if line.has_shortage() { "shortage" } else { "overage" }
                                ),
                            ));
                        }
                    }
                    VerificationStatus::Discrepancy => {}
                }
                Ok(vec![GrnEvent::GrnVerified(GrnVerified {
                    grn_id: self.record.id,
                    grn_number: self.record.grn_number.clone(),
                    purchase_order_id: self.record.purchase_order_id,
                    items,
                    verification_status: *requested,
                    reviewer: *reviewer,
                    occurred_at: *occurred_at,
                })])
            }
            GrnCommand::MarkMaterialized { occurred_at } => {
                self.ensure_created()?;
                self.ensure_not_materialized()?;
                if self.is_cancelled() {
                    return Err(self.invalid_transition("materialize"));
                }
                Ok(vec![GrnEvent::GrnInventoryAdded(GrnInventoryAdded {
                    grn_id: self.record.id,
                    grn_number: self.record.grn_number.clone(),
                    purchase_order_id: self.record.purchase_order_id,
                    occurred_at: *occurred_at,
                })])
            }
            GrnCommand::Cancel {
                reason,
                cancelled_by,
                occurred_at,
            } => {
                self.ensure_created()?;
                if self.is_cancelled() {
                    return Err(self.invalid_transition("cancel"));
                }
                self.ensure_not_materialized()?;
                self.ensure_pending()?;
                if reason.trim().is_empty() {
                    return Err(DomainError::validation("reason", "cancellation needs a reason"));
                }
                Ok(vec![GrnEvent::GrnCancelled(GrnCancelled {
                    grn_id: self.record.id,
                    grn_number: self.record.grn_number.clone(),
                    purchase_order_id: self.record.purchase_order_id,
                    reason: reason.trim().to_string(),
                    cancelled_by: *cancelled_by,
                    occurred_at: *occurred_at,
                })])
            }
            GrnCommand::Delete {
                deleted_by,
                occurred_at,
            } => {
                self.ensure_created()?;
                self.ensure_not_materialized()?;
                Ok(vec![GrnEvent::GrnDeleted(GrnDeleted {
                    grn_id: self.record.id,
                    grn_number: self.record.grn_number.clone(),
                    purchase_order_id: self.record.purchase_order_id,
                    was_first_grn: self.record.is_first_grn,
                    deleted_by: *deleted_by,
                    occurred_at: *occurred_at,
                })])
            }
        }
    }
}

impl GoodsReceiptNote {
    fn ensure_created(&self) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found("grn", self.record.id));
        }
        Ok(())
    }

    fn ensure_pending(&self) -> DomainResult<()> {
        if self.record.verification_status != VerificationStatus::Pending {
            return Err(DomainError::conflict(
                ConflictKind::AlreadyVerified,
                format!(
                    "GRN {} is already `{}`",
                    self.record.grn_number, self.record.verification_status
                ),
            ));
        }
        Ok(())
    }

    fn ensure_not_materialized(&self) -> DomainResult<()> {
        if self.record.inventory_added {
            return Err(DomainError::conflict(
                ConflictKind::AlreadyMaterialized,
                format!("inventory already added for GRN {}", self.record.grn_number),
            ));
        }
        Ok(())
    }

    fn ensure_open_for_counts(&self) -> DomainResult<()> {
        if self.is_cancelled() {
            return Err(self.invalid_transition("record counts on"));
        }
        self.ensure_not_materialized()?;
        self.ensure_pending()
    }

    fn invalid_transition(&self, action: &str) -> DomainError {
        DomainError::conflict(
            ConflictKind::InvalidTransition,
            format!(
                "cannot {action} GRN {} in status `{}`",
                self.record.grn_number, self.record.status
            ),
        )
    }

    /// Apply counts to every line; each GRN line must be counted exactly once.
    fn recount(&self, counts: &[LineCount]) -> DomainResult<Vec<ReceiptLine>> {
        if counts.is_empty() {
            return Err(DomainError::validation("items", "at least one count is required"));
        }

        let mut seen = HashSet::new();
        let mut updated = self.record.items_received.clone();
        for (idx, count) in counts.iter().enumerate() {
            let prefix = format!("items[{idx}]");
            let material = count.material_name.trim();
            if material.is_empty() {
                return Err(DomainError::validation("material_name", "must not be empty").within(&prefix));
            }
            let key = material.to_ascii_lowercase();
            if !seen.insert(key.clone()) {
                return Err(DomainError::validation(
                    "material_name",
                    format!("material `{material}` counted more than once"),
                )
                .within(&prefix));
            }
            let line = updated
                .iter_mut()
                .find(|l| l.material_name.to_ascii_lowercase() == key)
                .ok_or_else(|| {
                    DomainError::validation(
                        "material_name",
                        format!("`{material}` is not on GRN {}", self.record.grn_number),
                    )
                    .within(&prefix)
                })?;
            *line = line
                .recount(count.invoiced_quantity, count.received_quantity)
                .map_err(|e| e.within(&prefix))?;
        }

        if let Some(missing) = updated
            .iter()
            .find(|l| !seen.contains(&l.material_name.to_ascii_lowercase()))
        {
            return Err(DomainError::validation(
                "items",
                format!("no count given for `{}`", missing.material_name),
            ));
        }
        Ok(updated)
    }

    fn handle_open(&self, cmd: &OpenGrn) -> DomainResult<Vec<GrnEvent>> {
        if self.created {
            return Err(DomainError::conflict(
                ConflictKind::DuplicateGrn,
                format!("GRN {} already exists", self.record.grn_number),
            ));
        }
        if cmd.grn_id != self.record.id {
            return Err(DomainError::invariant("grn_id mismatch"));
        }
        if cmd.grn_sequence == 0 {
            return Err(DomainError::validation("grn_sequence", "sequence is 1-based"));
        }
        let is_first_grn = cmd.grn_sequence == 1;
        if is_first_grn && cmd.original_grn_id.is_some() {
            return Err(DomainError::invariant("the first GRN cannot reference an original GRN"));
        }
        if cmd.supplier_name.trim().is_empty() {
            return Err(DomainError::validation("supplier_name", "must not be empty"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("items", "GRN needs at least one line"));
        }
        let mut seen = HashSet::new();
        for (idx, line) in cmd.items.iter().enumerate() {
            let prefix = format!("items[{idx}]");
            line.validate().map_err(|e| e.within(&prefix))?;
            if !seen.insert(line.material_name.to_ascii_lowercase()) {
                return Err(DomainError::validation(
                    "material_name",
                    format!("material `{}` appears more than once", line.material_name),
                )
                .within(&prefix));
            }
        }

        Ok(vec![GrnEvent::GrnOpened(GrnOpened {
            grn_id: cmd.grn_id,
            grn_number: cmd.grn_number.clone(),
            purchase_order_id: cmd.purchase_order_id,
            vendor_id: cmd.vendor_id,
            supplier_name: cmd.supplier_name.trim().to_string(),
            grn_sequence: cmd.grn_sequence,
            is_first_grn,
            original_grn_id: cmd.original_grn_id,
            items: cmd.items.clone(),
            remarks: cmd.remarks.clone().filter(|r| !r.trim().is_empty()),
            opened_by: cmd.opened_by,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomerp_core::Quantity;
    use loomerp_events::execute;
    use loomerp_purchasing::PurchaseOrderLine;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn po_line(material: &str, qty: u32) -> PurchaseOrderLine {
        PurchaseOrderLine {
            line_no: 1,
            material_name: material.to_string(),
            unit: "m".to_string(),
            ordered_quantity: Quantity::from(qty),
            rate: dec!(50),
        }
    }

    fn opened_grn(materials: &[(&str, u32)]) -> GoodsReceiptNote {
        let id = GrnId::new();
        let mut grn = GoodsReceiptNote::empty(id);
        let items = materials
            .iter()
            .enumerate()
            .map(|(i, (m, q))| ReceiptLine::placeholder(i as u32 + 1, &po_line(m, *q), Quantity::from(*q)))
            .collect();
        execute(
            &mut grn,
            &GrnCommand::Open(OpenGrn {
                grn_id: id,
                grn_number: grn_number_for("PO-7", 1),
                purchase_order_id: PurchaseOrderId::new(),
                vendor_id: VendorId::new(),
                supplier_name: "Indigo Mills".to_string(),
                grn_sequence: 1,
                original_grn_id: None,
                items,
                remarks: None,
                opened_by: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        grn
    }

    fn count(material: &str, invoiced: Decimal, received: Decimal) -> LineCount {
        LineCount {
            material_name: material.to_string(),
            invoiced_quantity: invoiced,
            received_quantity: received,
        }
    }

    #[test]
    fn open_seeds_a_pending_first_grn() {
        let grn = opened_grn(&[("Denim", 100)]);
        assert!(grn.is_first_grn());
        assert_eq!(grn.grn_number(), "GRN-PO-7-01");
        assert_eq!(grn.verification_status(), VerificationStatus::Pending);
        assert_eq!(grn.status(), GrnStatus::Draft);
        assert_eq!(grn.version(), 1);
    }

    #[test]
    fn opening_twice_is_a_duplicate() {
        let grn = opened_grn(&[("Denim", 100)]);
        let err = grn
            .handle(&GrnCommand::Open(OpenGrn {
                grn_id: grn.id_typed(),
                grn_number: "GRN-PO-7-01".to_string(),
                purchase_order_id: grn.purchase_order_id(),
                vendor_id: grn.vendor_id(),
                supplier_name: "x".to_string(),
                grn_sequence: 1,
                original_grn_id: None,
                items: grn.items().to_vec(),
                remarks: None,
                opened_by: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateGrn));
    }

    #[test]
    fn short_count_flags_discrepancy() {
        let mut grn = opened_grn(&[("Denim", 100)]);
        execute(
            &mut grn,
            &GrnCommand::RecordCounts {
                counts: vec![count("denim", dec!(100), dec!(85))],
                recorded_by: None,
                occurred_at: test_time(),
            },
        )
        .unwrap();
        assert_eq!(grn.verification_status(), VerificationStatus::Discrepancy);
        assert_eq!(grn.status(), GrnStatus::Received);
        assert_eq!(grn.items()[0].shortage_quantity, Quantity::from(15));
        assert_eq!(grn.shortage_lines().count(), 1);
    }

    #[test]
    fn exact_count_verifies() {
        let mut grn = opened_grn(&[("Denim", 100), ("Zipper", 40)]);
        execute(
            &mut grn,
            &GrnCommand::RecordCounts {
                counts: vec![
                    count("Denim", dec!(100), dec!(100)),
                    count("Zipper", dec!(40), dec!(40)),
                ],
                recorded_by: None,
                occurred_at: test_time(),
            },
        )
        .unwrap();
        assert_eq!(grn.verification_status(), VerificationStatus::Verified);
    }

    #[test]
    fn counts_must_cover_every_line() {
        let grn = opened_grn(&[("Denim", 100), ("Zipper", 40)]);
        let err = grn
            .handle(&GrnCommand::RecordCounts {
                counts: vec![count("Denim", dec!(100), dec!(100))],
                recorded_by: None,
                occurred_at: test_time(),
            })
            .unwrap_err();
        match err {
            DomainError::Validation { field, message } => {
                assert_eq!(field, "items");
                assert!(message.contains("Zipper"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn negative_count_names_the_line() {
        let grn = opened_grn(&[("Denim", 100)]);
        let err = grn
            .handle(&GrnCommand::RecordCounts {
                counts: vec![count("Denim", dec!(100), dec!(-3))],
                recorded_by: None,
                occurred_at: test_time(),
            })
            .unwrap_err();
        match err {
            DomainError::InvalidQuantity { field, .. } => assert_eq!(field, "items[0].received_quantity"),
            other => panic!("expected invalid quantity, got {other:?}"),
        }
    }

    #[test]
    fn decided_grn_cannot_be_reverified() {
        let mut grn = opened_grn(&[("Denim", 100)]);
        execute(
            &mut grn,
            &GrnCommand::RecordCounts {
                counts: vec![count("Denim", dec!(100), dec!(85))],
                recorded_by: None,
                occurred_at: test_time(),
            },
        )
        .unwrap();

        for requested in [VerificationStatus::Verified, VerificationStatus::Discrepancy] {
            let err = grn
                .handle(&GrnCommand::Verify {
                    requested,
                    reviewer: None,
                    occurred_at: test_time(),
                })
                .unwrap_err();
            assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyVerified));
        }
    }

    #[test]
    fn reviewer_can_verify_placeholder_counts() {
        let mut grn = opened_grn(&[("Denim", 100)]);
        let reviewer = UserId::new();
        execute(
            &mut grn,
            &GrnCommand::Verify {
                requested: VerificationStatus::Verified,
                reviewer: Some(reviewer),
                occurred_at: test_time(),
            },
        )
        .unwrap();
        assert_eq!(grn.verification_status(), VerificationStatus::Verified);
        assert_eq!(grn.record().reviewed_by, Some(reviewer));
        assert_eq!(grn.items()[0].quality_status, crate::ItemQuality::Passed);
    }

    #[test]
    fn materialize_flag_flips_once() {
        let mut grn = opened_grn(&[("Denim", 100)]);
        execute(&mut grn, &GrnCommand::MarkMaterialized { occurred_at: test_time() }).unwrap();
        assert!(grn.inventory_added());
        assert_eq!(grn.status(), GrnStatus::Completed);

        let err = grn
            .handle(&GrnCommand::MarkMaterialized { occurred_at: test_time() })
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyMaterialized));

        let err = grn
            .handle(&GrnCommand::Delete { deleted_by: None, occurred_at: test_time() })
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyMaterialized));
    }

    #[test]
    fn cancelled_grn_rejects_counts() {
        let mut grn = opened_grn(&[("Denim", 100)]);
        execute(
            &mut grn,
            &GrnCommand::Cancel {
                reason: "truck turned back".to_string(),
                cancelled_by: None,
                occurred_at: test_time(),
            },
        )
        .unwrap();
        assert!(grn.is_cancelled());
        assert!(!grn.is_reconciled());

        let err = grn
            .handle(&GrnCommand::RecordCounts {
                counts: vec![count("Denim", dec!(1), dec!(1))],
                recorded_by: None,
                occurred_at: test_time(),
            })
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::InvalidTransition));
    }

    #[test]
    fn restore_rejects_unreconciled_lines() {
        let grn = opened_grn(&[("Denim", 100)]);
        let mut record = grn.into_record();
        record.items_received[0].overage_quantity = Quantity::from(2);
        assert!(GoodsReceiptNote::restore(record).is_err());
    }

    #[test]
    fn serializes_as_flat_record() {
        let grn = opened_grn(&[("Denim", 100)]);
        let json = serde_json::to_value(&grn).unwrap();
        assert_eq!(json["verification_status"], "pending");
        assert_eq!(json["grn_sequence"], 1);
        assert!(json["items_received"].is_array());
    }
}
