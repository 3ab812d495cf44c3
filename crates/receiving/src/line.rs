use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use loomerp_core::{DomainError, DomainResult, Quantity};
use loomerp_purchasing::PurchaseOrderLine;

/// Per-item verdict stored on each reconciled GRN line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemQuality {
    /// Counts not entered yet (placeholder line).
    Pending,
    Passed,
    Shortage,
    Overage,
}

/// Output of [`reconcile`] for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub ordered_quantity: Quantity,
    pub invoiced_quantity: Quantity,
    pub received_quantity: Quantity,
    pub shortage_quantity: Quantity,
    pub overage_quantity: Quantity,
    pub discrepancy_flag: bool,
    pub quality_status: ItemQuality,
}

/// Reconcile one line's ordered / invoiced / received quantities.
///
/// Shortage and overage are measured against the invoice, never against the order:
/// the vendor is accountable for what it billed.
pub fn reconcile(
    ordered: Decimal,
    invoiced: Decimal,
    received: Decimal,
) -> DomainResult<Reconciliation> {
    let ordered_quantity = Quantity::new("ordered_quantity", ordered)?;
    let invoiced_quantity = Quantity::new("invoiced_quantity", invoiced)?;
    let received_quantity = Quantity::new("received_quantity", received)?;

    let shortage_quantity = invoiced_quantity.saturating_sub(received_quantity);
    let overage_quantity = received_quantity.saturating_sub(invoiced_quantity);

    let quality_status = if !shortage_quantity.is_zero() {
        ItemQuality::Shortage
    } else if !overage_quantity.is_zero() {
        ItemQuality::Overage
    } else {
        ItemQuality::Passed
    };

    Ok(Reconciliation {
        ordered_quantity,
        invoiced_quantity,
        received_quantity,
        shortage_quantity,
        overage_quantity,
        discrepancy_flag: quality_status != ItemQuality::Passed,
        quality_status,
    })
}

/// One reconciled line of a goods receipt note (`items_received[i]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_no: u32,
    pub material_name: String,
    pub unit: String,
    pub rate: Decimal,
    pub ordered_quantity: Quantity,
    pub invoiced_quantity: Quantity,
    pub received_quantity: Quantity,
    pub shortage_quantity: Quantity,
    pub overage_quantity: Quantity,
    pub quality_status: ItemQuality,
    pub discrepancy_flag: bool,
}

impl ReceiptLine {
    /// Seed line copied from the purchase order: invoiced and received default to the
    /// ordered quantity until physical counts are entered.
    pub fn placeholder(line_no: u32, po_line: &PurchaseOrderLine, ordered: Quantity) -> Self {
        Self {
            line_no,
            material_name: po_line.material_name.clone(),
            unit: po_line.unit.clone(),
            rate: po_line.rate,
            ordered_quantity: ordered,
            invoiced_quantity: ordered,
            received_quantity: ordered,
            shortage_quantity: Quantity::ZERO,
            overage_quantity: Quantity::ZERO,
            quality_status: ItemQuality::Pending,
            discrepancy_flag: false,
        }
    }

    /// Overwrite invoiced/received counts and re-run the reconciler.
    pub fn recount(&self, invoiced: Decimal, received: Decimal) -> DomainResult<Self> {
        let r = reconcile(self.ordered_quantity.value(), invoiced, received)?;
        Ok(self.with(r))
    }

    /// Re-run the reconciler on the counts already on the line.
    pub fn reconciled(&self) -> DomainResult<Self> {
        self.recount(self.invoiced_quantity.value(), self.received_quantity.value())
    }

    fn with(&self, r: Reconciliation) -> Self {
        Self {
            line_no: self.line_no,
            material_name: self.material_name.clone(),
            unit: self.unit.clone(),
            rate: self.rate,
            ordered_quantity: r.ordered_quantity,
            invoiced_quantity: r.invoiced_quantity,
            received_quantity: r.received_quantity,
            shortage_quantity: r.shortage_quantity,
            overage_quantity: r.overage_quantity,
            quality_status: r.quality_status,
            discrepancy_flag: r.discrepancy_flag,
        }
    }

    pub fn has_shortage(&self) -> bool {
        !self.shortage_quantity.is_zero()
    }

    pub fn shortage_value(&self) -> Decimal {
        self.shortage_quantity.value_at(self.rate)
    }

    /// Quantity that counts towards the ordered amount; overage is tracked separately.
    pub fn accepted_quantity(&self) -> Quantity {
        self.received_quantity.min(self.invoiced_quantity)
    }

    /// Check a line loaded from storage or received over the wire.
    ///
    /// Rejects lines whose stored shortage/overage disagree with their counts, so
    /// `received = invoiced - shortage + overage` holds for everything we keep.
    pub fn validate(&self) -> DomainResult<()> {
        if self.material_name.trim().is_empty() {
            return Err(DomainError::validation("material_name", "must not be empty"));
        }
        if self.rate < Decimal::ZERO {
            return Err(DomainError::validation("rate", "must not be negative"));
        }
        let expected = reconcile(
            self.ordered_quantity.value(),
            self.invoiced_quantity.value(),
            self.received_quantity.value(),
        )?;
        if expected.shortage_quantity != self.shortage_quantity
            || expected.overage_quantity != self.overage_quantity
            || expected.discrepancy_flag != self.discrepancy_flag
        {
            return Err(DomainError::invariant(format!(
                "line `{}` does not reconcile (received {} vs invoiced {} - shortage {} + overage {})",
                self.material_name,
                self.received_quantity,
                self.invoiced_quantity,
                self.shortage_quantity,
                self.overage_quantity
            )));
        }
        if self.quality_status != ItemQuality::Pending
            && self.quality_status != expected.quality_status
        {
            return Err(DomainError::invariant(format!(
                "line `{}` carries a stale quality verdict",
                self.material_name
            )));
        }
        Ok(())
    }
}
