use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use loomerp_core::{ConflictKind, DomainError, DomainResult, GrnId, Quantity, UserId};
use loomerp_purchasing::PurchaseOrder;

use crate::grn::{GoodsReceiptNote, LineCount, OpenGrn, grn_number_for};
use crate::line::ReceiptLine;

/// Ordered vs. accepted-to-date for one purchase order material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingLine {
    pub material_name: String,
    pub unit: String,
    pub rate: Decimal,
    pub ordered_quantity: Quantity,
    pub received_quantity: Quantity,
    pub outstanding_quantity: Quantity,
    /// Shorted on an invoice and not yet made good by a follow-up GRN.
    pub unresolved_shortage: Quantity,
}

/// One line of a shortage-fulfillment receipt as submitted by the store keeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortageReceiptLine {
    pub material_name: String,
    pub ordered_quantity: Decimal,
    pub invoiced_quantity: Decimal,
    pub received_quantity: Decimal,
}

/// All GRNs of one purchase order, in sequence order.
///
/// Quantities only count reconciled, non-cancelled GRNs. What counts towards the
/// order is `min(invoiced, received)` per line; anything above that is overage.
#[derive(Debug, Clone)]
pub struct GrnChain<'a> {
    order: &'a PurchaseOrder,
    grns: Vec<&'a GoodsReceiptNote>,
}

impl<'a> GrnChain<'a> {
    pub fn new(order: &'a PurchaseOrder, grns: &'a [GoodsReceiptNote]) -> DomainResult<Self> {
        if let Some(foreign) = grns
            .iter()
            .find(|g| g.purchase_order_id() != order.id_typed())
        {
            return Err(DomainError::invariant(format!(
                "GRN {} does not belong to purchase order {}",
                foreign.grn_number(),
                order.po_number()
            )));
        }
        validate_lineage(grns)?;

        let mut grns: Vec<&GoodsReceiptNote> = grns.iter().collect();
        grns.sort_by_key(|g| g.grn_sequence());
        Ok(Self { order, grns })
    }

    pub fn order(&self) -> &'a PurchaseOrder {
        self.order
    }

    pub fn grns(&self) -> impl Iterator<Item = &'a GoodsReceiptNote> + '_ {
        self.grns.iter().copied()
    }

    /// Non-cancelled GRNs.
    pub fn live(&self) -> impl Iterator<Item = &'a GoodsReceiptNote> + '_ {
        self.grns().filter(|g| !g.is_cancelled())
    }

    pub fn reconciled(&self) -> impl Iterator<Item = &'a GoodsReceiptNote> + '_ {
        self.grns().filter(|g| g.is_reconciled())
    }

    pub fn first(&self) -> Option<&'a GoodsReceiptNote> {
        self.grns().find(|g| g.is_first_grn())
    }

    /// Sequence numbers are never reused, even after cancellation.
    pub fn next_sequence(&self) -> u32 {
        self.grns().map(|g| g.grn_sequence()).max().unwrap_or(0) + 1
    }

    /// Accepted quantity of `material` over reconciled GRNs, optionally skipping one.
    pub fn received_to_date(&self, material: &str, excluding: Option<GrnId>) -> Quantity {
        self.reconciled()
            .filter(|g| Some(g.id_typed()) != excluding)
            .filter_map(|g| g.line_for(material))
            .map(ReceiptLine::accepted_quantity)
            .sum()
    }

    pub fn outstanding_for(&self, material: &str) -> Quantity {
        match self.order.line_for(material) {
            Some(line) => line
                .ordered_quantity
                .saturating_sub(self.received_to_date(material, None)),
            None => Quantity::ZERO,
        }
    }

    pub fn outstanding(&self) -> Vec<OutstandingLine> {
        self.order
            .lines()
            .iter()
            .map(|line| {
                let received = self.received_to_date(&line.material_name, None);
                OutstandingLine {
                    material_name: line.material_name.clone(),
                    unit: line.unit.clone(),
                    rate: line.rate,
                    ordered_quantity: line.ordered_quantity,
                    received_quantity: received,
                    outstanding_quantity: line.ordered_quantity.saturating_sub(received),
                    unresolved_shortage: self.unresolved_shortage_for(&line.material_name),
                }
            })
            .collect()
    }

    /// Invoiced-but-not-received quantity of `material` still owed by the vendor.
    ///
    /// Shortages on reconciled GRNs minus what follow-up GRNs accepted, capped by
    /// what is still outstanding on the order. A receipt that matches its invoice
    /// leaves nothing owed even when the invoice covered less than the order.
    pub fn unresolved_shortage_for(&self, material: &str) -> Quantity {
        let shorted: Quantity = self
            .reconciled()
            .filter_map(|g| g.line_for(material))
            .map(|l| l.shortage_quantity)
            .sum();
        let made_good: Quantity = self
            .reconciled()
            .filter(|g| !g.is_first_grn())
            .filter_map(|g| g.line_for(material))
            .map(ReceiptLine::accepted_quantity)
            .sum();
        shorted
            .saturating_sub(made_good)
            .min(self.outstanding_for(material))
    }

    pub fn has_unresolved_shortage(&self) -> bool {
        self.order
            .lines()
            .iter()
            .any(|line| !self.unresolved_shortage_for(&line.material_name).is_zero())
    }

    /// Plan GRN #1, seeded from the order lines with placeholder counts.
    pub fn plan_seed(
        &self,
        grn_id: GrnId,
        remarks: Option<String>,
        opened_by: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<OpenGrn> {
        self.ensure_order_accepts_receipts()?;
        if let Some(first) = self.first() {
            return Err(DomainError::conflict(
                ConflictKind::DuplicateGrn,
                format!(
                    "purchase order {} already has first GRN {}",
                    self.order.po_number(),
                    first.grn_number()
                ),
            ));
        }
        if self.grns().any(|g| g.grn_sequence() == 1) {
            return Err(DomainError::conflict(
                ConflictKind::DuplicateGrn,
                format!("GRN #1 already exists for purchase order {}", self.order.po_number()),
            ));
        }

        let items: Vec<ReceiptLine> = self
            .order
            .lines()
            .iter()
            .filter_map(|line| {
                let outstanding = self.outstanding_for(&line.material_name);
                (!outstanding.is_zero()).then_some((line, outstanding))
            })
            .enumerate()
            .map(|(idx, (line, outstanding))| ReceiptLine::placeholder(idx as u32 + 1, line, outstanding))
            .collect();
        if items.is_empty() {
            return Err(DomainError::validation(
                "items",
                format!("nothing outstanding on purchase order {}", self.order.po_number()),
            ));
        }

        Ok(OpenGrn {
            grn_id,
            grn_number: grn_number_for(self.order.po_number(), 1),
            purchase_order_id: self.order.id_typed(),
            vendor_id: self.order.vendor_id(),
            supplier_name: self.order.vendor_name().to_string(),
            grn_sequence: 1,
            original_grn_id: None,
            items,
            remarks,
            opened_by,
            occurred_at,
        })
    }

    /// Plan a follow-up GRN receiving goods that an earlier discrepancy GRN came up short on.
    ///
    /// Returns the open command (placeholder lines) and the counts to record on it.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_shortage_fulfillment(
        &self,
        grn_id: GrnId,
        supplier_name: Option<String>,
        remarks: Option<String>,
        lines: &[ShortageReceiptLine],
        opened_by: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<(OpenGrn, Vec<LineCount>)> {
        self.ensure_order_accepts_receipts()?;

        if !self.has_unresolved_shortage() {
            return Err(DomainError::conflict(
                ConflictKind::InvalidTransition,
                format!(
                    "purchase order {} has no discrepancy GRN with an outstanding shortage",
                    self.order.po_number()
                ),
            ));
        }
        if lines.is_empty() {
            return Err(DomainError::validation("items", "at least one line is required"));
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(lines.len());
        let mut counts = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            let prefix = format!("items[{idx}]");
            let material = line.material_name.trim();
            let po_line = self.order.line_for(material).ok_or_else(|| {
                DomainError::validation(
                    "material_name",
                    format!("`{material}` is not on purchase order {}", self.order.po_number()),
                )
                .within(&prefix)
            })?;
            if !seen.insert(po_line.material_name.to_ascii_lowercase()) {
                return Err(DomainError::validation(
                    "material_name",
                    format!("material `{material}` appears more than once"),
                )
                .within(&prefix));
            }

            let ordered = Quantity::new("ordered_quantity", line.ordered_quantity)
                .map_err(|e| e.within(&prefix))?;
            let outstanding = self.outstanding_for(&po_line.material_name);
            if ordered.is_zero() {
                return Err(DomainError::invalid_quantity("ordered_quantity", "must be positive").within(&prefix));
            }
            if ordered > outstanding {
                return Err(DomainError::validation(
                    "ordered_quantity",
                    format!(
                        "{ordered} {} exceeds the outstanding {outstanding} for `{}`",
                        po_line.unit, po_line.material_name
                    ),
                )
                .within(&prefix));
            }

            items.push(ReceiptLine::placeholder(idx as u32 + 1, po_line, ordered));
            counts.push(LineCount {
                material_name: po_line.material_name.clone(),
                invoiced_quantity: line.invoiced_quantity,
                received_quantity: line.received_quantity,
            });
        }

        let sequence = self.next_sequence();
        let open = OpenGrn {
            grn_id,
            grn_number: grn_number_for(self.order.po_number(), sequence),
            purchase_order_id: self.order.id_typed(),
            vendor_id: self.order.vendor_id(),
            supplier_name: supplier_name
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| self.order.vendor_name().to_string()),
            grn_sequence: sequence,
            original_grn_id: self.first().map(|g| g.id_typed()),
            items,
            remarks,
            opened_by,
            occurred_at,
        };
        Ok((open, counts))
    }

    /// Cumulative accepted quantity may not exceed the ordered quantity; anything
    /// beyond must be recorded as overage on the GRN that received it.
    pub fn check_within_order(&self, grn: &GoodsReceiptNote) -> DomainResult<()> {
        for (idx, line) in grn.items().iter().enumerate() {
            let Some(po_line) = self.order.line_for(&line.material_name) else {
                return Err(DomainError::validation(
                    "material_name",
                    format!("`{}` is not on purchase order {}", line.material_name, self.order.po_number()),
                )
                .within(&format!("items[{idx}]")));
            };
            let elsewhere = self.received_to_date(&line.material_name, Some(grn.id_typed()));
            let remaining = po_line.ordered_quantity.saturating_sub(elsewhere);
            if line.accepted_quantity() > remaining {
                return Err(DomainError::validation(
                    "received_quantity",
                    format!(
                        "`{}`: accepting {} would exceed the ordered {} ({} already received); record the excess as overage",
                        line.material_name,
                        line.accepted_quantity(),
                        po_line.ordered_quantity,
                        elsewhere
                    ),
                )
                .within(&format!("items[{idx}]")));
            }
        }
        Ok(())
    }

    fn ensure_order_accepts_receipts(&self) -> DomainResult<()> {
        if !self.order.status().accepts_receipts() {
            return Err(DomainError::conflict(
                ConflictKind::InvalidTransition,
                format!(
                    "purchase order {} is `{}` and cannot receive goods",
                    self.order.po_number(),
                    self.order.status()
                ),
            ));
        }
        Ok(())
    }
}

/// Single-root and lineage rules over any set of GRNs (possibly spanning orders).
pub fn validate_lineage(grns: &[GoodsReceiptNote]) -> DomainResult<()> {
    let by_id: HashMap<GrnId, &GoodsReceiptNote> = grns.iter().map(|g| (g.id_typed(), g)).collect();

    let mut roots = HashSet::new();
    for grn in grns.iter().filter(|g| g.is_first_grn()) {
        if !roots.insert(grn.purchase_order_id()) {
            return Err(DomainError::invariant(format!(
                "purchase order {} has more than one first GRN",
                grn.purchase_order_id()
            )));
        }
    }

    for grn in grns {
        if grn.is_first_grn() {
            if grn.original_grn_id().is_some() {
                return Err(DomainError::invariant(format!(
                    "first GRN {} references an original GRN",
                    grn.grn_number()
                )));
            }
            continue;
        }
        let Some(original_id) = grn.original_grn_id() else {
            continue;
        };
        match by_id.get(&original_id) {
            Some(original)
                if original.purchase_order_id() == grn.purchase_order_id()
                    && original.is_first_grn() => {}
            _ => {
                return Err(DomainError::invariant(format!(
                    "GRN {} points at {original_id}, which is not the first GRN of its purchase order",
                    grn.grn_number()
                )));
            }
        }
    }
    Ok(())
}
