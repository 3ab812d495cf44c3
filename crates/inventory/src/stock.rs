use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use loomerp_core::{
    ConflictKind, DomainError, DomainResult, Entity, GrnId, InventoryId, MovementId,
    PurchaseOrderId, Quantity, UserId,
};
use loomerp_events::Event;
use loomerp_receiving::{GoodsReceiptNote, ReceiptLine, VerificationStatus};

/// Quality bucket of a stock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Approved,
    Quarantine,
    PendingInspection,
}

impl QualityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityStatus::Approved => "approved",
            QualityStatus::Quarantine => "quarantine",
            QualityStatus::PendingInspection => "pending_inspection",
        }
    }
}

impl core::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for QualityStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(QualityStatus::Approved),
            "quarantine" => Ok(QualityStatus::Quarantine),
            "pending_inspection" => Ok(QualityStatus::PendingInspection),
            other => Err(DomainError::validation(
                "quality_status",
                format!("unknown quality status `{other}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockType {
    RawMaterial,
}

impl StockType {
    pub fn as_str(self) -> &'static str {
        match self {
            StockType::RawMaterial => "raw_material",
        }
    }
}

impl core::str::FromStr for StockType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw_material" => Ok(StockType::RawMaterial),
            other => Err(DomainError::validation("stock_type", format!("unknown stock type `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    GrnReceipt,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::GrnReceipt => "grn_receipt",
        }
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grn_receipt" => Ok(MovementType::GrnReceipt),
            other => Err(DomainError::validation(
                "movement_type",
                format!("unknown movement type `{other}`"),
            )),
        }
    }
}

/// One materialized stock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: InventoryId,
    pub material_name: String,
    pub unit: String,
    pub current_stock: Quantity,
    pub unit_cost: Decimal,
    pub quality_status: QualityStatus,
    pub stock_type: StockType,
    pub purchase_order_id: PurchaseOrderId,
    pub grn_id: GrnId,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for InventoryRecord {
    type Id = InventoryId;

    fn entity_id(&self) -> InventoryId {
        self.id
    }
}

/// Append-only audit row written next to every [`InventoryRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub id: MovementId,
    pub inventory_id: InventoryId,
    pub grn_id: GrnId,
    pub purchase_order_id: PurchaseOrderId,
    pub movement_type: MovementType,
    pub quantity: Quantity,
    pub previous_stock: Quantity,
    pub new_stock: Quantity,
    pub reference: String,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Entity for InventoryMovement {
    type Id = MovementId;

    fn entity_id(&self) -> MovementId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEntry {
    pub record: InventoryRecord,
    pub movement: InventoryMovement,
}

/// Summary of one stock row as carried on the outbox event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedRow {
    pub inventory_id: InventoryId,
    pub material_name: String,
    pub quantity: Quantity,
    pub quality_status: QualityStatus,
}

/// Event: GrnMaterialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnMaterialized {
    pub grn_id: GrnId,
    pub grn_number: String,
    pub purchase_order_id: PurchaseOrderId,
    pub rows: Vec<MaterializedRow>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    GrnMaterialized(GrnMaterialized),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::GrnMaterialized(_) => "inventory.grn.materialized",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::GrnMaterialized(e) => e.occurred_at,
        }
    }
}

/// Quality bucket for a line.
///
/// Until the GRN has been verified everything waits for inspection. After that a
/// short line is quarantined in full, not just the shortfall.
pub fn quality_for(line: &ReceiptLine, verification: VerificationStatus) -> QualityStatus {
    if verification == VerificationStatus::Pending {
        QualityStatus::PendingInspection
    } else if line.has_shortage() {
        QualityStatus::Quarantine
    } else {
        QualityStatus::Approved
    }
}

/// Rows to write for one GRN plus the event announcing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialization {
    pub grn_id: GrnId,
    pub entries: Vec<StockEntry>,
    pub event: InventoryEvent,
}

/// Plan the stock rows for a GRN whose inventory has not been added yet.
///
/// Lines with nothing received produce no rows.
pub fn plan_materialization(
    grn: &GoodsReceiptNote,
    actor: Option<UserId>,
    occurred_at: DateTime<Utc>,
) -> DomainResult<Materialization> {
    if grn.inventory_added() {
        return Err(DomainError::conflict(
            ConflictKind::AlreadyMaterialized,
            format!("inventory already added for GRN {}", grn.grn_number()),
        ));
    }
    if grn.is_cancelled() {
        return Err(DomainError::conflict(
            ConflictKind::InvalidTransition,
            format!("GRN {} is cancelled", grn.grn_number()),
        ));
    }

    let verification = grn.verification_status();
    let entries: Vec<StockEntry> = grn
        .items()
        .iter()
        .filter(|line| !line.received_quantity.is_zero())
        .map(|line| {
            let inventory_id = InventoryId::new();
            let record = InventoryRecord {
                id: inventory_id,
                material_name: line.material_name.clone(),
                unit: line.unit.clone(),
                current_stock: line.received_quantity,
                unit_cost: line.rate,
                quality_status: quality_for(line, verification),
                stock_type: StockType::RawMaterial,
                purchase_order_id: grn.purchase_order_id(),
                grn_id: grn.id_typed(),
                notes: format!("Received via GRN {}", grn.grn_number()),
                created_at: occurred_at,
            };
            let movement = InventoryMovement {
                id: MovementId::new(),
                inventory_id,
                grn_id: grn.id_typed(),
                purchase_order_id: grn.purchase_order_id(),
                movement_type: MovementType::GrnReceipt,
                quantity: line.received_quantity,
                previous_stock: Quantity::ZERO,
                new_stock: line.received_quantity,
                reference: grn.grn_number().to_string(),
                created_by: actor,
                created_at: occurred_at,
            };
            StockEntry { record, movement }
        })
        .collect();

    let event = InventoryEvent::GrnMaterialized(GrnMaterialized {
        grn_id: grn.id_typed(),
        grn_number: grn.grn_number().to_string(),
        purchase_order_id: grn.purchase_order_id(),
        rows: entries
            .iter()
            .map(|e| MaterializedRow {
                inventory_id: e.record.id,
                material_name: e.record.material_name.clone(),
                quantity: e.record.current_stock,
                quality_status: e.record.quality_status,
            })
            .collect(),
        occurred_at,
    });

    Ok(Materialization {
        grn_id: grn.id_typed(),
        entries,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomerp_core::{PurchaseOrderId, VendorId};
    use loomerp_events::execute;
    use loomerp_purchasing::PurchaseOrderLine;
    use loomerp_receiving::{GrnCommand, LineCount, OpenGrn};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn pending_grn(lines: &[(&str, u32)]) -> GoodsReceiptNote {
        let id = GrnId::new();
        let items = lines
            .iter()
            .enumerate()
            .map(|(i, (material, qty))| {
                let po_line = PurchaseOrderLine {
                    line_no: i as u32 + 1,
                    material_name: material.to_string(),
                    unit: "m".to_string(),
                    ordered_quantity: Quantity::from(*qty),
                    rate: dec!(50),
                };
                ReceiptLine::placeholder(i as u32 + 1, &po_line, Quantity::from(*qty))
            })
            .collect();
        let mut grn = GoodsReceiptNote::empty(id);
        execute(
            &mut grn,
            &GrnCommand::Open(OpenGrn {
                grn_id: id,
                grn_number: "GRN-PO-1-01".to_string(),
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

    fn counted(mut grn: GoodsReceiptNote, counts: &[(&str, Decimal, Decimal)]) -> GoodsReceiptNote {
        execute(
            &mut grn,
            &GrnCommand::RecordCounts {
                counts: counts
                    .iter()
                    .map(|(m, inv, rec)| LineCount {
                        material_name: m.to_string(),
                        invoiced_quantity: *inv,
                        received_quantity: *rec,
                    })
                    .collect(),
                recorded_by: None,
                occurred_at: test_time(),
            },
        )
        .unwrap();
        grn
    }

    #[test]
    fn short_line_is_quarantined_in_full() {
        let grn = counted(pending_grn(&[("Denim", 100)]), &[("Denim", dec!(100), dec!(85))]);
        let plan = plan_materialization(&grn, None, test_time()).unwrap();
        assert_eq!(plan.entries.len(), 1);
        let entry = &plan.entries[0];
        assert_eq!(entry.record.current_stock, Quantity::from(85));
        assert_eq!(entry.record.quality_status, QualityStatus::Quarantine);
        assert_eq!(entry.record.notes, "Received via GRN GRN-PO-1-01");
        assert_eq!(entry.movement.previous_stock, Quantity::ZERO);
        assert_eq!(entry.movement.new_stock, Quantity::from(85));
        assert_eq!(entry.movement.inventory_id, entry.record.id);
    }

    #[test]
    fn overage_and_exact_lines_are_approved() {
        let grn = counted(
            pending_grn(&[("Denim", 100), ("Thread", 10)]),
            &[("Denim", dec!(100), dec!(104)), ("Thread", dec!(10), dec!(10))],
        );
        let plan = plan_materialization(&grn, None, test_time()).unwrap();
        assert!(plan
            .entries
            .iter()
            .all(|e| e.record.quality_status == QualityStatus::Approved));
    }

    #[test]
    fn unverified_grn_waits_for_inspection() {
        let grn = pending_grn(&[("Denim", 100)]);
        let plan = plan_materialization(&grn, None, test_time()).unwrap();
        assert_eq!(plan.entries[0].record.quality_status, QualityStatus::PendingInspection);
    }

    #[test]
    fn nothing_received_means_no_row() {
        let grn = counted(
            pending_grn(&[("Denim", 100), ("Thread", 10)]),
            &[("Denim", dec!(100), dec!(100)), ("Thread", dec!(10), dec!(0))],
        );
        let plan = plan_materialization(&grn, None, test_time()).unwrap();
        assert_eq!(plan.entries.len(), 1);
        match &plan.event {
            InventoryEvent::GrnMaterialized(e) => assert_eq!(e.rows.len(), 1),
        }
    }

    #[test]
    fn materialized_grn_is_rejected() {
        let mut grn = pending_grn(&[("Denim", 100)]);
        execute(&mut grn, &GrnCommand::MarkMaterialized { occurred_at: test_time() }).unwrap();
        let err = plan_materialization(&grn, None, test_time()).unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyMaterialized));
    }

    fn qty() -> impl Strategy<Value = Decimal> {
        (0i64..100_000, 0u32..3).prop_map(|(m, s)| Decimal::new(m, s))
    }

    proptest! {
        #[test]
        fn quarantine_iff_short(invoiced in qty(), received in qty()) {
            let line = ReceiptLine::placeholder(
                1,
                &PurchaseOrderLine {
                    line_no: 1,
                    material_name: "Denim".to_string(),
                    unit: "m".to_string(),
                    ordered_quantity: Quantity::from(100),
                    rate: dec!(50),
                },
                Quantity::from(100),
            )
            .recount(invoiced, received)
            .unwrap();
            for verification in [VerificationStatus::Verified, VerificationStatus::Discrepancy] {
                let quality = quality_for(&line, verification);
                prop_assert_eq!(quality == QualityStatus::Quarantine, received < invoiced);
            }
            prop_assert_eq!(
                quality_for(&line, VerificationStatus::Pending),
                QualityStatus::PendingInspection
            );
        }
    }
}
