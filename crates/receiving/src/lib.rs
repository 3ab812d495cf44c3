//! Receiving domain module: goods receipt notes and their reconciliation.
//!
//! - [`line`]: the Line-Item Reconciler (pure shortage/overage arithmetic)
//! - [`grn`]: the `GoodsReceiptNote` aggregate and its verification state machine
//! - [`ledger`]: sequencing and lineage rules across all GRNs of one purchase order
//! - [`status_sync`]: purchase order status derived from the GRN chain
//!
//! Everything here is deterministic; persistence lives in `loomerp-infra`.

pub mod grn;
pub mod ledger;
pub mod line;
pub mod status_sync;

pub use grn::{
    GoodsReceiptNote, GrnCancelled, GrnCommand, GrnCountsRecorded, GrnDeleted, GrnEvent,
    GrnInventoryAdded, GrnOpened, GrnRecord, GrnStatus, GrnVerified, LineCount, OpenGrn,
    VerificationStatus, grn_number_for,
};
pub use ledger::{GrnChain, OutstandingLine, ShortageReceiptLine, validate_lineage};
pub use line::{ItemQuality, ReceiptLine, Reconciliation, reconcile};
pub use status_sync::{ReceiptProgress, receipt_progress, target_status};
