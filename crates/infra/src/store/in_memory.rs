use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use loomerp_core::{AggregateRoot, ExpectedVersion, GrnId, OutboxId, PurchaseOrderId, VendorReturnId};
use loomerp_inventory::StockEntry;
use loomerp_purchasing::PurchaseOrder;
use loomerp_receiving::{GoodsReceiptNote, GrnRecord};
use loomerp_returns::VendorReturn;

use super::{ReceivingStore, ReceivingTx, StoreError};
use crate::outbox::{OutboxMessage, OutboxStatus};

#[derive(Debug, Clone, Default)]
struct Tables {
    purchase_orders: HashMap<PurchaseOrderId, PurchaseOrder>,
    grns: HashMap<GrnId, GrnRecord>,
    stock: Vec<StockEntry>,
    vendor_returns: HashMap<VendorReturnId, VendorReturn>,
    outbox: Vec<OutboxMessage>,
}

/// In-memory receiving store.
///
/// Intended for tests/dev. A transaction holds the store lock from `begin` until
/// commit or rollback and works on a copy of the tables, so transactions are
/// fully serialized and a rollback simply drops the copy.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReceivingStore {
    tables: Arc<Mutex<Tables>>,
    fail_next_commit: Arc<AtomicBool>,
    fail_acks: Arc<AtomicUsize>,
    lose_materialization_claims: Arc<AtomicBool>,
}

impl InMemoryReceivingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after all of its writes were staged.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `mark_delivered` fail.
    pub fn fail_next_acks(&self, count: usize) {
        self.fail_acks.store(count, Ordering::SeqCst);
    }

    /// Make every `claim_materialization` report that another writer got there first.
    pub fn lose_materialization_claims(&self) {
        self.lose_materialization_claims.store(true, Ordering::SeqCst);
    }

    pub async fn grn(&self, id: GrnId) -> Option<GrnRecord> {
        self.tables.lock().await.grns.get(&id).cloned()
    }

    pub async fn purchase_order(&self, id: PurchaseOrderId) -> Option<PurchaseOrder> {
        self.tables.lock().await.purchase_orders.get(&id).cloned()
    }

    pub async fn stock(&self) -> Vec<StockEntry> {
        self.tables.lock().await.stock.clone()
    }

    pub async fn vendor_returns(&self) -> Vec<VendorReturn> {
        self.tables.lock().await.vendor_returns.values().cloned().collect()
    }

    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.tables.lock().await.outbox.clone()
    }
}

#[async_trait]
impl ReceivingStore for InMemoryReceivingStore {
    async fn begin(&self) -> Result<Box<dyn ReceivingTx>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        let fail_commit = self.fail_next_commit.swap(false, Ordering::SeqCst);
        let lose_claims = self.lose_materialization_claims.load(Ordering::SeqCst);
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            fail_commit,
            lose_claims,
        }))
    }

    async fn claim_outbox(
        &self,
        batch_size: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let now = Utc::now();
        let expired_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(now);

        let mut tables = self.tables.lock().await;
        let mut claimed = Vec::new();
        for message in tables
            .outbox
            .iter_mut()
            .filter(|m| match m.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Processing => m.claimed_at.is_none_or(|at| at <= expired_before),
                _ => false,
            })
            .take(batch_size as usize)
        {
            message.reclaimed = message.status == OutboxStatus::Processing;
            message.status = OutboxStatus::Processing;
            message.attempts += 1;
            message.claimed_at = Some(now);
            claimed.push(message.clone());
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: OutboxId) -> Result<(), StoreError> {
        let fail = self
            .fail_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Backend(format!("acknowledging outbox message {id} failed")));
        }
        let mut tables = self.tables.lock().await;
        let message = outbox_row(&mut tables, id)?;
        message.status = OutboxStatus::Delivered;
        message.last_error = None;
        message.claimed_at = None;
        Ok(())
    }

    async fn release_outbox(
        &self,
        id: OutboxId,
        error: &str,
        max_attempts: u32,
    ) -> Result<OutboxStatus, StoreError> {
        let mut tables = self.tables.lock().await;
        let message = outbox_row(&mut tables, id)?;
        message.status = if message.attempts >= max_attempts {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };
        message.last_error = Some(error.to_string());
        message.claimed_at = None;
        Ok(message.status)
    }
}

fn outbox_row(tables: &mut Tables, id: OutboxId) -> Result<&mut OutboxMessage, StoreError> {
    tables
        .outbox
        .iter_mut()
        .find(|m| m.id == id)
        .ok_or_else(|| StoreError::Backend(format!("outbox message {id} not found")))
}

struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    fail_commit: bool,
    lose_claims: bool,
}

#[async_trait]
impl ReceivingTx for InMemoryTx {
    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        Ok(self.working.purchase_orders.get(&id).cloned())
    }

    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError> {
        let id = order.id_typed();
        if self.working.purchase_orders.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("purchase order {id} already exists")));
        }
        if self
            .working
            .purchase_orders
            .values()
            .any(|po| po.po_number() == order.po_number())
        {
            return Err(StoreError::Duplicate(format!(
                "purchase order number {} already exists",
                order.po_number()
            )));
        }
        self.working.purchase_orders.insert(id, order.clone());
        Ok(())
    }

    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = order.id_typed();
        let current = self
            .working
            .purchase_orders
            .get(&id)
            .ok_or_else(|| StoreError::Concurrency(format!("purchase order {id} no longer exists")))?;
        if !expected.matches(current.version()) {
            return Err(StoreError::Concurrency(format!(
                "purchase order {id}: expected {expected:?}, found {}",
                current.version()
            )));
        }
        self.working.purchase_orders.insert(id, order.clone());
        Ok(())
    }

    async fn find_grn(&mut self, id: GrnId) -> Result<Option<GoodsReceiptNote>, StoreError> {
        self.working
            .grns
            .get(&id)
            .cloned()
            .map(restore_grn)
            .transpose()
    }

    async fn list_grns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<GoodsReceiptNote>, StoreError> {
        let mut records: Vec<GrnRecord> = self
            .working
            .grns
            .values()
            .filter(|r| r.purchase_order_id == purchase_order_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.grn_sequence);
        records.into_iter().map(restore_grn).collect()
    }

    async fn insert_grn(&mut self, grn: &GoodsReceiptNote) -> Result<(), StoreError> {
        let record = grn.record();
        // Same uniqueness rules as the Postgres schema.
        for other in self.working.grns.values() {
            if other.id == record.id || other.grn_number == record.grn_number {
                return Err(StoreError::Duplicate(format!("GRN {} already exists", record.grn_number)));
            }
            if other.purchase_order_id == record.purchase_order_id {
                if other.grn_sequence == record.grn_sequence {
                    return Err(StoreError::Duplicate(format!(
                        "GRN sequence {} already used on purchase order {}",
                        record.grn_sequence, record.purchase_order_id
                    )));
                }
                if other.is_first_grn && record.is_first_grn {
                    return Err(StoreError::Duplicate(format!(
                        "purchase order {} already has a first GRN",
                        record.purchase_order_id
                    )));
                }
            }
        }
        self.working.grns.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_grn(
        &mut self,
        grn: &GoodsReceiptNote,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let record = grn.record();
        let current = self
            .working
            .grns
            .get(&record.id)
            .ok_or_else(|| StoreError::Concurrency(format!("GRN {} no longer exists", record.id)))?;
        if !expected.matches(current.version) {
            return Err(StoreError::Concurrency(format!(
                "GRN {}: expected {expected:?}, found {}",
                record.grn_number, current.version
            )));
        }
        self.working.grns.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_grn(&mut self, id: GrnId) -> Result<(), StoreError> {
        if self.working.stock.iter().any(|e| e.record.grn_id == id) {
            return Err(StoreError::Backend(format!("GRN {id} still has inventory rows")));
        }
        self.working.grns.remove(&id);
        for child in self.working.grns.values_mut() {
            if child.original_grn_id == Some(id) {
                child.original_grn_id = None;
            }
        }
        Ok(())
    }

    async fn claim_materialization(&mut self, id: GrnId) -> Result<bool, StoreError> {
        if self.lose_claims {
            return Ok(false);
        }
        match self.working.grns.get_mut(&id) {
            Some(record) if !record.inventory_added => {
                record.inventory_added = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_stock(&mut self, entries: &[StockEntry]) -> Result<(), StoreError> {
        self.working.stock.extend_from_slice(entries);
        Ok(())
    }

    async fn stock_for_grn(&mut self, id: GrnId) -> Result<Vec<StockEntry>, StoreError> {
        Ok(self
            .working
            .stock
            .iter()
            .filter(|e| e.record.grn_id == id)
            .cloned()
            .collect())
    }

    async fn list_vendor_returns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<VendorReturn>, StoreError> {
        let mut claims: Vec<VendorReturn> = self
            .working
            .vendor_returns
            .values()
            .filter(|c| c.purchase_order_id() == purchase_order_id)
            .cloned()
            .collect();
        claims.sort_by_key(|c| (c.created_at(), c.id_typed()));
        Ok(claims)
    }

    async fn save_vendor_return(
        &mut self,
        claim: &VendorReturn,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = claim.id_typed();
        match self.working.vendor_returns.get(&id) {
            Some(current) if !expected.matches(current.version()) => {
                return Err(StoreError::Concurrency(format!(
                    "vendor return {}: expected {expected:?}, found {}",
                    claim.return_number(),
                    current.version()
                )));
            }
            Some(_) => {}
            None => {
                if self
                    .working
                    .vendor_returns
                    .values()
                    .any(|c| c.purchase_order_id() == claim.purchase_order_id() && c.grn_id() == claim.grn_id())
                {
                    return Err(StoreError::Duplicate(format!(
                        "GRN {} already has a vendor return",
                        claim.grn_id()
                    )));
                }
            }
        }
        self.working.vendor_returns.insert(id, claim.clone());
        Ok(())
    }

    async fn delete_vendor_returns_for_grn(&mut self, grn_id: GrnId) -> Result<(), StoreError> {
        self.working.vendor_returns.retain(|_, c| c.grn_id() != grn_id);
        Ok(())
    }

    async fn enqueue(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.working.outbox.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            mut guard,
            working,
            fail_commit,
            lose_claims: _,
        } = *self;
        if fail_commit {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

fn restore_grn(record: GrnRecord) -> Result<GoodsReceiptNote, StoreError> {
    GoodsReceiptNote::restore(record).map_err(|e| StoreError::Serialization(e.to_string()))
}
