//! Transactional repository boundary for the receiving workflow.
//!
//! The engine opens one [`ReceivingTx`] per operation, reads and writes through it,
//! and either commits or rolls back. Implementations must make every write inside a
//! transaction visible atomically on commit and discard all of them on rollback.
//!
//! Locking contract:
//! - `lock_purchase_order` takes an exclusive lock on the order row. Every engine
//!   operation that touches a GRN chain locks its purchase order first, so chain
//!   operations on the same order are serialized.
//! - `list_grns` locks the chain's GRN rows in sequence order.
//! - `claim_materialization` is an atomic compare-and-swap on `inventory_added`.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use loomerp_core::{ExpectedVersion, GrnId, OutboxId, PurchaseOrderId};
use loomerp_inventory::StockEntry;
use loomerp_purchasing::PurchaseOrder;
use loomerp_receiving::GoodsReceiptNote;
use loomerp_returns::VendorReturn;

use crate::outbox::{OutboxMessage, OutboxStatus};

pub use in_memory::InMemoryReceivingStore;
pub use postgres::PostgresReceivingStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The row's version no longer matches the caller's expectation.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// A uniqueness rule rejected the write.
    #[error("duplicate row: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored row could not be turned back into a domain value.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Store handle shared by the engine and the outbox relay.
#[async_trait]
pub trait ReceivingStore: Send + Sync + 'static {
    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn ReceivingTx>, StoreError>;

    /// Claim up to `batch_size` pending outbox messages, oldest first.
    ///
    /// Claimed messages move to `processing` with `attempts` incremented. A
    /// `processing` message whose claim is older than `lease` was abandoned by
    /// its relay and is claimed again.
    async fn claim_outbox(
        &self,
        batch_size: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_delivered(&self, id: OutboxId) -> Result<(), StoreError>;

    /// Return a message to `pending` after a failed delivery, or park it as
    /// `failed` once `max_attempts` is reached. Returns the resulting status.
    async fn release_outbox(
        &self,
        id: OutboxId,
        error: &str,
        max_attempts: u32,
    ) -> Result<OutboxStatus, StoreError>;
}

/// One open transaction.
#[async_trait]
pub trait ReceivingTx: Send {
    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError>;

    /// Overwrite the order row; `expected` is the version the caller loaded.
    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Plain read of one GRN (no lock). Used to find the owning purchase order
    /// before taking locks in order.
    async fn find_grn(&mut self, id: GrnId) -> Result<Option<GoodsReceiptNote>, StoreError>;

    /// All GRNs of a purchase order in sequence order, locked for update.
    async fn list_grns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<GoodsReceiptNote>, StoreError>;

    async fn insert_grn(&mut self, grn: &GoodsReceiptNote) -> Result<(), StoreError>;

    /// Overwrite the GRN row; `expected` is the version the caller loaded.
    async fn update_grn(
        &mut self,
        grn: &GoodsReceiptNote,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Delete a GRN; children pointing at it lose their `original_grn_id`.
    async fn delete_grn(&mut self, id: GrnId) -> Result<(), StoreError>;

    /// Flip `inventory_added` from false to true. Returns `false` when another
    /// writer got there first (or the row is gone).
    async fn claim_materialization(&mut self, id: GrnId) -> Result<bool, StoreError>;

    async fn insert_stock(&mut self, entries: &[StockEntry]) -> Result<(), StoreError>;

    async fn stock_for_grn(&mut self, id: GrnId) -> Result<Vec<StockEntry>, StoreError>;

    /// Claims of a purchase order, oldest first.
    async fn list_vendor_returns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<VendorReturn>, StoreError>;

    /// Insert or update a claim (keyed by id). `expected` applies to updates.
    async fn save_vendor_return(
        &mut self,
        claim: &VendorReturn,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn delete_vendor_returns_for_grn(&mut self, grn_id: GrnId) -> Result<(), StoreError>;

    /// Append an outbox message; it becomes visible to the relay on commit.
    async fn enqueue(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
