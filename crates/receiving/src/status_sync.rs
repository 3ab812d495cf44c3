use serde::{Deserialize, Serialize};

use loomerp_purchasing::PurchaseOrderStatus;

use crate::ledger::GrnChain;

/// How far the GRN chain has got towards receiving the whole order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptProgress {
    /// No reconciled GRN has stock on the books yet.
    NothingReceived,
    Partial,
    /// No shortage left unresolved and every reconciled GRN materialized.
    Complete,
}

pub fn receipt_progress(chain: &GrnChain<'_>) -> ReceiptProgress {
    let mut any_materialized = false;
    let mut all_materialized = true;
    for grn in chain.reconciled() {
        any_materialized |= grn.inventory_added();
        all_materialized &= grn.inventory_added();
    }

    if !any_materialized {
        ReceiptProgress::NothingReceived
    } else if all_materialized && !chain.has_unresolved_shortage() {
        ReceiptProgress::Complete
    } else {
        ReceiptProgress::Partial
    }
}

/// Status the order should move to, or `None` when it stays put.
///
/// Only ever moves forward; closed orders are left alone.
pub fn target_status(chain: &GrnChain<'_>) -> Option<PurchaseOrderStatus> {
    let current = chain.order().status();
    if current.is_closed() {
        return None;
    }
    let target = match receipt_progress(chain) {
        ReceiptProgress::NothingReceived => return None,
        ReceiptProgress::Partial => PurchaseOrderStatus::PartialReceived,
        ReceiptProgress::Complete => PurchaseOrderStatus::Received,
    };
    current.is_forward_to(target).then_some(target)
}
