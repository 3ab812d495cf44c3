use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use loomerp_core::{
    AggregateRoot, ConflictKind, DomainError, DomainResult, Entity, GrnId, PurchaseOrderId,
    Quantity, VendorId, VendorReturnId,
};
use loomerp_events::Event;
use loomerp_receiving::{GoodsReceiptNote, ReceiptLine};

/// Resolution lifecycle of a claim.
///
/// `pending → acknowledged → resolved | disputed → closed`. Moves past `pending`
/// belong to the vendor-response workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    Pending,
    Acknowledged,
    Resolved,
    Disputed,
    Closed,
}

impl ReturnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReturnStatus::Pending => "pending",
            ReturnStatus::Acknowledged => "acknowledged",
            ReturnStatus::Resolved => "resolved",
            ReturnStatus::Disputed => "disputed",
            ReturnStatus::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, to: ReturnStatus) -> bool {
        matches!(
            (self, to),
            (ReturnStatus::Pending, ReturnStatus::Acknowledged)
                | (ReturnStatus::Acknowledged, ReturnStatus::Resolved)
                | (ReturnStatus::Acknowledged, ReturnStatus::Disputed)
                | (ReturnStatus::Resolved, ReturnStatus::Closed)
                | (ReturnStatus::Disputed, ReturnStatus::Closed)
        )
    }
}

impl core::fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReturnStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReturnStatus::Pending),
            "acknowledged" => Ok(ReturnStatus::Acknowledged),
            "resolved" => Ok(ReturnStatus::Resolved),
            "disputed" => Ok(ReturnStatus::Disputed),
            "closed" => Ok(ReturnStatus::Closed),
            other => Err(DomainError::validation("status", format!("unknown return status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    Shortage,
}

impl ReturnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReturnType::Shortage => "shortage",
        }
    }
}

/// One shorted line of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortageItem {
    pub material_name: String,
    pub unit: String,
    pub rate: Decimal,
    pub shortage_quantity: Quantity,
    /// Quantity later delivered by shortage-fulfillment GRNs.
    pub fulfilled_quantity: Quantity,
}

impl ShortageItem {
    fn from_line(line: &ReceiptLine) -> Self {
        Self {
            material_name: line.material_name.clone(),
            unit: line.unit.clone(),
            rate: line.rate,
            shortage_quantity: line.shortage_quantity,
            fulfilled_quantity: Quantity::ZERO,
        }
    }

    pub fn line_value(&self) -> Decimal {
        self.shortage_quantity.value_at(self.rate)
    }

    pub fn outstanding(&self) -> Quantity {
        self.shortage_quantity.saturating_sub(self.fulfilled_quantity)
    }
}

/// Aggregate root: VendorReturn, one per (purchase order, GRN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorReturn {
    id: VendorReturnId,
    return_number: String,
    purchase_order_id: PurchaseOrderId,
    grn_id: GrnId,
    vendor_id: VendorId,
    return_type: ReturnType,
    status: ReturnStatus,
    items: Vec<ShortageItem>,
    total_shortage_value: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl VendorReturn {
    /// Rebuild a persisted claim; the stored total must match its items.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: VendorReturnId,
        return_number: String,
        purchase_order_id: PurchaseOrderId,
        grn_id: GrnId,
        vendor_id: VendorId,
        status: ReturnStatus,
        items: Vec<ShortageItem>,
        total_shortage_value: Decimal,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: u64,
    ) -> DomainResult<Self> {
        let claim = Self {
            id,
            return_number,
            purchase_order_id,
            grn_id,
            vendor_id,
            return_type: ReturnType::Shortage,
            status,
            items,
            total_shortage_value,
            created_at,
            updated_at,
            version,
        };
        if !claim.is_consistent() {
            return Err(DomainError::invariant(format!(
                "vendor return {} total {} does not match its items",
                claim.return_number, claim.total_shortage_value
            )));
        }
        Ok(claim)
    }

    pub fn id_typed(&self) -> VendorReturnId {
        self.id
    }

    pub fn return_number(&self) -> &str {
        &self.return_number
    }

    pub fn purchase_order_id(&self) -> PurchaseOrderId {
        self.purchase_order_id
    }

    pub fn grn_id(&self) -> GrnId {
        self.grn_id
    }

    pub fn vendor_id(&self) -> VendorId {
        self.vendor_id
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    pub fn status(&self) -> ReturnStatus {
        self.status
    }

    pub fn items(&self) -> &[ShortageItem] {
        &self.items
    }

    pub fn total_shortage_value(&self) -> Decimal {
        self.total_shortage_value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_consistent(&self) -> bool {
        self.total_shortage_value == self.items.iter().map(ShortageItem::line_value).sum::<Decimal>()
    }

    pub fn outstanding_for(&self, material: &str) -> Quantity {
        self.items
            .iter()
            .filter(|i| i.material_name.eq_ignore_ascii_case(material))
            .map(ShortageItem::outstanding)
            .sum()
    }

    /// Vendor-response workflow move.
    pub fn transition(&mut self, to: ReturnStatus, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::conflict(
                ConflictKind::InvalidTransition,
                format!(
                    "vendor return {} cannot move from `{}` to `{to}`",
                    self.return_number, self.status
                ),
            ));
        }
        self.status = to;
        self.touch(occurred_at);
        Ok(())
    }

    fn set_items(&mut self, items: Vec<ShortageItem>, occurred_at: DateTime<Utc>) {
        self.total_shortage_value = items.iter().map(ShortageItem::line_value).sum();
        self.items = items;
        self.touch(occurred_at);
    }

    fn touch(&mut self, occurred_at: DateTime<Utc>) {
        self.updated_at = occurred_at;
        self.version += 1;
    }

    fn updated_event(&self) -> VendorReturnEvent {
        VendorReturnEvent::VendorReturnUpdated(VendorReturnUpdated {
            vendor_return_id: self.id,
            return_number: self.return_number.clone(),
            purchase_order_id: self.purchase_order_id,
            grn_id: self.grn_id,
            items: self.items.clone(),
            total_shortage_value: self.total_shortage_value,
            occurred_at: self.updated_at,
        })
    }
}

impl AggregateRoot for VendorReturn {
    type Id = VendorReturnId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Entity for VendorReturn {
    type Id = VendorReturnId;

    fn entity_id(&self) -> VendorReturnId {
        self.id
    }
}

/// Event: VendorReturnRaised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorReturnRaised {
    pub vendor_return_id: VendorReturnId,
    pub return_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub grn_id: GrnId,
    pub vendor_id: VendorId,
    pub items: Vec<ShortageItem>,
    pub total_shortage_value: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VendorReturnUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorReturnUpdated {
    pub vendor_return_id: VendorReturnId,
    pub return_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub grn_id: GrnId,
    pub items: Vec<ShortageItem>,
    pub total_shortage_value: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorReturnEvent {
    VendorReturnRaised(VendorReturnRaised),
    VendorReturnUpdated(VendorReturnUpdated),
}

impl VendorReturnEvent {
    pub fn vendor_return_id(&self) -> VendorReturnId {
        match self {
            VendorReturnEvent::VendorReturnRaised(e) => e.vendor_return_id,
            VendorReturnEvent::VendorReturnUpdated(e) => e.vendor_return_id,
        }
    }
}

impl Event for VendorReturnEvent {
    fn event_type(&self) -> &'static str {
        match self {
            VendorReturnEvent::VendorReturnRaised(_) => "returns.vendor_return.raised",
            VendorReturnEvent::VendorReturnUpdated(_) => "returns.vendor_return.updated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            VendorReturnEvent::VendorReturnRaised(e) => e.occurred_at,
            VendorReturnEvent::VendorReturnUpdated(e) => e.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Raised(VendorReturn, VendorReturnEvent),
    Updated(VendorReturn, VendorReturnEvent),
    /// No shorted lines, or the existing claim already matches.
    Unchanged,
}

/// Raise the claim for a reconciled GRN, or refresh the one already on file for it.
pub fn raise_or_update(
    existing: Option<&VendorReturn>,
    grn: &GoodsReceiptNote,
    new_id: VendorReturnId,
    occurred_at: DateTime<Utc>,
) -> DomainResult<ClaimOutcome> {
    let mut items: Vec<ShortageItem> = grn.shortage_lines().map(ShortageItem::from_line).collect();

    let Some(existing) = existing else {
        if items.is_empty() {
            return Ok(ClaimOutcome::Unchanged);
        }
        let total_shortage_value = items.iter().map(ShortageItem::line_value).sum();
        let claim = VendorReturn {
            id: new_id,
            return_number: format!("VR-{}", grn.grn_number()),
            purchase_order_id: grn.purchase_order_id(),
            grn_id: grn.id_typed(),
            vendor_id: grn.vendor_id(),
            return_type: ReturnType::Shortage,
            status: ReturnStatus::Pending,
            items,
            total_shortage_value,
            created_at: occurred_at,
            updated_at: occurred_at,
            version: 1,
        };
        let event = VendorReturnEvent::VendorReturnRaised(VendorReturnRaised {
            vendor_return_id: claim.id,
            return_number: claim.return_number.clone(),
            purchase_order_id: claim.purchase_order_id,
            grn_id: claim.grn_id,
            vendor_id: claim.vendor_id,
            items: claim.items.clone(),
            total_shortage_value: claim.total_shortage_value,
            occurred_at,
        });
        return Ok(ClaimOutcome::Raised(claim, event));
    };

    if existing.grn_id != grn.id_typed() || existing.purchase_order_id != grn.purchase_order_id() {
        return Err(DomainError::invariant(format!(
            "vendor return {} belongs to another GRN",
            existing.return_number
        )));
    }

    // Keep what was already delivered against each material, capped at the new shortage.
    for item in &mut items {
        if let Some(prev) = existing
            .items
            .iter()
            .find(|p| p.material_name.eq_ignore_ascii_case(&item.material_name))
        {
            item.fulfilled_quantity = prev.fulfilled_quantity.min(item.shortage_quantity);
        }
    }
    if items == existing.items {
        return Ok(ClaimOutcome::Unchanged);
    }

    let mut claim = existing.clone();
    claim.set_items(items, occurred_at);
    let event = claim.updated_event();
    Ok(ClaimOutcome::Updated(claim, event))
}

/// Book a fulfillment GRN's accepted quantities against open claims, oldest first.
///
/// Returns one update event per claim that changed; closed claims are skipped.
pub fn apply_fulfillment(
    claims: &mut [VendorReturn],
    fulfillment: &GoodsReceiptNote,
    occurred_at: DateTime<Utc>,
) -> Vec<VendorReturnEvent> {
    claims.sort_by(|a, b| match a.created_at.cmp(&b.created_at) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });

    let mut changed = vec![false; claims.len()];
    for line in fulfillment.items() {
        let mut remaining = line.accepted_quantity();
        for (idx, claim) in claims.iter_mut().enumerate() {
            if remaining.is_zero() {
                break;
            }
            if claim.status == ReturnStatus::Closed || claim.grn_id == fulfillment.id_typed() {
                continue;
            }
            for item in claim
                .items
                .iter_mut()
                .filter(|i| i.material_name.eq_ignore_ascii_case(&line.material_name))
            {
                let take = remaining.min(item.outstanding());
                if take.is_zero() {
                    continue;
                }
                item.fulfilled_quantity = item.fulfilled_quantity + take;
                remaining = remaining.saturating_sub(take);
                changed[idx] = true;
            }
        }
    }

    claims
        .iter_mut()
        .zip(changed)
        .filter(|(_, changed)| *changed)
        .map(|(claim, _)| {
            claim.touch(occurred_at);
            claim.updated_event()
        })
        .collect()
}
