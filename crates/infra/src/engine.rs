//! Transactional receiving engine.
//!
//! Every public operation runs in exactly one store transaction:
//!
//! 1. Lock the purchase order row, then the GRN chain (always in that order).
//! 2. Run the pure domain decisions (ledger, reconciler, claims, materializer,
//!    status synchronizer) against the locked state.
//! 3. Write the evolved rows and append the emitted events to the outbox.
//! 4. Commit, or roll back on the first error.
//!
//! Notifications are never sent from inside the transaction; the outbox relay
//! picks the committed events up afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use loomerp_core::{
    AggregateRoot, ConflictKind, DomainError, ExpectedVersion, GrnId, PurchaseOrderId, UserId,
    VendorReturnId,
};
use loomerp_events::{Event, execute};
use loomerp_inventory::{StockEntry, plan_materialization};
use loomerp_purchasing::{
    CreatePurchaseOrder, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderStatus,
};
use loomerp_receiving::{
    GoodsReceiptNote, GrnChain, GrnCommand, GrnEvent, LineCount, OutstandingLine,
    ReceiptProgress, ShortageReceiptLine, VerificationStatus, receipt_progress, target_status,
};
use loomerp_returns::{ClaimOutcome, VendorReturn, apply_fulfillment, raise_or_update};

use crate::outbox::{OutboxMessage, OutboxRelay};
use crate::store::{ReceivingStore, ReceivingTx, StoreError};

const PURCHASE_ORDER_AGGREGATE: &str = "purchasing.order";
const GRN_AGGREGATE: &str = "receiving.grn";
const VENDOR_RETURN_AGGREGATE: &str = "returns.vendor_return";
const STOCK_AGGREGATE: &str = "inventory.grn_stock";

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Rejected before any write; names the offending field.
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The request conflicts with stored state; `current` carries the
    /// authoritative GRN when one is involved.
    #[error("conflict ({kind}): {message}")]
    Conflict {
        kind: ConflictKind,
        message: String,
        current: Option<Box<GoodsReceiptNote>>,
    },

    /// Persistence failed mid-operation; nothing was applied.
    #[error("transaction failed: {0}")]
    TransactionFailure(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            EngineError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Attach the current GRN state to a conflict; other errors pass through.
    pub fn with_current(self, grn: &GoodsReceiptNote) -> Self {
        match self {
            EngineError::Conflict { kind, message, .. } => EngineError::Conflict {
                kind,
                message,
                current: Some(Box::new(grn.clone())),
            },
            other => other,
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidQuantity { field, reason } => EngineError::Validation {
                field,
                message: reason,
            },
            DomainError::Validation { field, message } => EngineError::Validation { field, message },
            DomainError::InvalidId(message) => EngineError::Validation {
                field: "id".to_string(),
                message,
            },
            DomainError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            DomainError::Conflict { kind, message } => EngineError::Conflict {
                kind,
                message,
                current: None,
            },
            DomainError::InvariantViolation(msg) => {
                EngineError::TransactionFailure(format!("invariant violated: {msg}"))
            }
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Concurrency(message) => EngineError::Conflict {
                kind: ConflictKind::StaleVersion,
                message,
                current: None,
            },
            StoreError::Duplicate(message) => EngineError::Conflict {
                kind: ConflictKind::DuplicateGrn,
                message,
                current: None,
            },
            other @ (StoreError::Backend(_) | StoreError::Serialization(_)) => {
                EngineError::TransactionFailure(other.to_string())
            }
        }
    }
}

/// Result of an operation that reconciles a GRN.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptOutcome {
    pub grn: GoodsReceiptNote,
    /// Claims raised or updated by this operation.
    pub vendor_returns: Vec<VendorReturn>,
    /// Stock written by this operation (empty when already materialized).
    pub stock: Vec<StockEntry>,
    pub purchase_order_status: PurchaseOrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Created(Vec<StockEntry>),
    /// The GRN was already materialized; these are the rows written back then.
    Replayed(Vec<StockEntry>),
}

impl MaterializeOutcome {
    pub fn entries(&self) -> &[StockEntry] {
        match self {
            MaterializeOutcome::Created(rows) | MaterializeOutcome::Replayed(rows) => rows,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, MaterializeOutcome::Replayed(_))
    }
}

/// Shortage-fulfillment receipt as submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortageFulfillment {
    pub supplier_name: Option<String>,
    pub remarks: Option<String>,
    pub items: Vec<ShortageReceiptLine>,
}

/// Read model of one purchase order's receiving state.
#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub purchase_order_id: PurchaseOrderId,
    pub po_number: String,
    pub vendor_name: String,
    pub status: PurchaseOrderStatus,
    pub progress: ReceiptProgress,
    pub grns: Vec<GoodsReceiptNote>,
    pub outstanding: Vec<OutstandingLine>,
    pub vendor_returns: Vec<VendorReturn>,
}

pub struct ReceivingEngine<S> {
    store: Arc<S>,
    relay: Option<Arc<OutboxRelay<S>>>,
}

impl<S> ReceivingEngine<S>
where
    S: ReceivingStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store, relay: None }
    }

    /// Drain the outbox through `relay` right after every successful commit.
    pub fn with_relay(mut self, relay: Arc<OutboxRelay<S>>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register a purchase order handed over by procurement.
    #[instrument(skip(self, command), fields(purchase_order_id = %command.order_id), err)]
    pub async fn register_purchase_order(
        &self,
        command: CreatePurchaseOrder,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrder> {
        let mut tx = self.store.begin().await?;
        let result = self.register_purchase_order_in(tx.as_mut(), command, actor).await;
        self.finish("register_purchase_order", tx, result).await
    }

    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn approve_purchase_order(
        &self,
        purchase_order_id: PurchaseOrderId,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let command = PurchaseOrderCommand::Approve {
            occurred_at: Utc::now(),
        };
        let mut tx = self.store.begin().await?;
        let result = self
            .order_command_in(tx.as_mut(), purchase_order_id, command, actor)
            .await;
        self.finish("approve_purchase_order", tx, result).await
    }

    /// Open the first GRN of an order, seeded with placeholder counts, and move
    /// the order to `grn_requested`.
    #[instrument(skip(self, remarks), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn open_receipt(
        &self,
        purchase_order_id: PurchaseOrderId,
        remarks: Option<String>,
        actor: Option<UserId>,
    ) -> EngineResult<GoodsReceiptNote> {
        let mut tx = self.store.begin().await?;
        let result = self
            .open_receipt_in(tx.as_mut(), purchase_order_id, remarks, actor, Utc::now())
            .await;
        self.finish("open_receipt", tx, result).await
    }

    /// Record physical counts on a pending GRN, then raise claims, write stock
    /// and advance the order.
    #[instrument(skip(self, counts), fields(grn_id = %grn_id), err)]
    pub async fn record_counts(
        &self,
        grn_id: GrnId,
        counts: Vec<LineCount>,
        actor: Option<UserId>,
    ) -> EngineResult<ReceiptOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self
            .record_counts_in(tx.as_mut(), grn_id, counts, actor, Utc::now())
            .await;
        self.finish("record_counts", tx, result).await
    }

    /// Reviewer decision on a pending GRN.
    #[instrument(skip(self), fields(grn_id = %grn_id), err)]
    pub async fn verify_grn(
        &self,
        grn_id: GrnId,
        requested: VerificationStatus,
        reviewer: Option<UserId>,
    ) -> EngineResult<ReceiptOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self
            .verify_grn_in(tx.as_mut(), grn_id, requested, reviewer, Utc::now())
            .await;
        self.finish("verify_grn", tx, result).await
    }

    /// Receive goods an earlier discrepancy GRN came up short on.
    #[instrument(skip(self, request), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn create_shortage_fulfillment(
        &self,
        purchase_order_id: PurchaseOrderId,
        request: ShortageFulfillment,
        actor: Option<UserId>,
    ) -> EngineResult<ReceiptOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self
            .shortage_fulfillment_in(tx.as_mut(), purchase_order_id, request, actor, Utc::now())
            .await;
        self.finish("create_shortage_fulfillment", tx, result).await
    }

    /// Write stock for a GRN. Retrying on a materialized GRN returns the rows
    /// written the first time.
    #[instrument(skip(self), fields(grn_id = %grn_id), err)]
    pub async fn materialize(
        &self,
        grn_id: GrnId,
        actor: Option<UserId>,
    ) -> EngineResult<MaterializeOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self
            .materialize_in(tx.as_mut(), grn_id, actor, Utc::now())
            .await;
        self.finish("materialize", tx, result).await
    }

    /// Recompute the order status from its GRN chain.
    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn sync_purchase_order(
        &self,
        purchase_order_id: PurchaseOrderId,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let mut tx = self.store.begin().await?;
        let result = self
            .resync_in(tx.as_mut(), purchase_order_id, actor, Utc::now())
            .await;
        self.finish("sync_purchase_order", tx, result).await
    }

    #[instrument(skip(self, reason), fields(grn_id = %grn_id), err)]
    pub async fn cancel_grn(
        &self,
        grn_id: GrnId,
        reason: String,
        actor: Option<UserId>,
    ) -> EngineResult<GoodsReceiptNote> {
        let mut tx = self.store.begin().await?;
        let result = self
            .cancel_grn_in(tx.as_mut(), grn_id, reason, actor, Utc::now())
            .await;
        self.finish("cancel_grn", tx, result).await
    }

    #[instrument(skip(self), fields(grn_id = %grn_id), err)]
    pub async fn delete_grn(&self, grn_id: GrnId, actor: Option<UserId>) -> EngineResult<()> {
        let mut tx = self.store.begin().await?;
        let result = self
            .delete_grn_in(tx.as_mut(), grn_id, actor, Utc::now())
            .await;
        self.finish("delete_grn", tx, result).await
    }

    /// Downstream fulfillment done: `received → completed`.
    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn mark_fulfilled(
        &self,
        purchase_order_id: PurchaseOrderId,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let command = PurchaseOrderCommand::MarkFulfilled {
            occurred_at: Utc::now(),
        };
        let mut tx = self.store.begin().await?;
        let result = self
            .order_command_in(tx.as_mut(), purchase_order_id, command, actor)
            .await;
        self.finish("mark_fulfilled", tx, result).await
    }

    #[instrument(skip(self, reason), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn cancel_purchase_order(
        &self,
        purchase_order_id: PurchaseOrderId,
        reason: String,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let command = PurchaseOrderCommand::Cancel {
            reason,
            occurred_at: Utc::now(),
        };
        let mut tx = self.store.begin().await?;
        let result = self
            .order_command_in(tx.as_mut(), purchase_order_id, command, actor)
            .await;
        self.finish("cancel_purchase_order", tx, result).await
    }

    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    pub async fn chain_summary(
        &self,
        purchase_order_id: PurchaseOrderId,
    ) -> EngineResult<ChainSummary> {
        let mut tx = self.store.begin().await?;
        let result = self.chain_summary_in(tx.as_mut(), purchase_order_id).await;
        self.finish("chain_summary", tx, result).await
    }

    pub async fn grn(&self, grn_id: GrnId) -> EngineResult<GoodsReceiptNote> {
        let mut tx = self.store.begin().await?;
        let result = match tx.find_grn(grn_id).await {
            Ok(Some(grn)) => Ok(grn),
            Ok(None) => Err(EngineError::not_found("grn", grn_id)),
            Err(err) => Err(err.into()),
        };
        self.finish("grn", tx, result).await
    }

    /// Stock rows written for a GRN (empty until it is materialized).
    pub async fn stock_for_grn(&self, grn_id: GrnId) -> EngineResult<Vec<StockEntry>> {
        let mut tx = self.store.begin().await?;
        let result = async {
            if tx.find_grn(grn_id).await?.is_none() {
                return Err(EngineError::not_found("grn", grn_id));
            }
            Ok(tx.stock_for_grn(grn_id).await?)
        }
        .await;
        self.finish("stock_for_grn", tx, result).await
    }

    async fn finish<T: Send>(
        &self,
        operation: &'static str,
        tx: Box<dyn ReceivingTx>,
        result: EngineResult<T>,
    ) -> EngineResult<T> {
        match result {
            Ok(value) => {
                tx.commit().await.map_err(|err| {
                    error!(operation, error = %err, "commit failed; transaction rolled back");
                    EngineError::TransactionFailure(err.to_string())
                })?;
                debug!(operation, "transaction committed");
                self.dispatch_outbox().await;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(operation, error = %rollback_err, "rollback failed");
                }
                debug!(operation, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    async fn dispatch_outbox(&self) {
        if let Some(relay) = &self.relay {
            if let Err(err) = relay.drain_once().await {
                warn!(error = %err, "post-commit outbox drain failed; the relay will pick it up");
            }
        }
    }

    async fn register_purchase_order_in(
        &self,
        tx: &mut dyn ReceivingTx,
        command: CreatePurchaseOrder,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrder> {
        let id = command.order_id;
        if tx.lock_purchase_order(id).await?.is_some() {
            return Err(EngineError::Conflict {
                kind: ConflictKind::InvalidTransition,
                message: format!("purchase order {id} already exists"),
                current: None,
            });
        }
        let mut order = PurchaseOrder::empty(id);
        let events = execute(&mut order, &PurchaseOrderCommand::CreatePurchaseOrder(command))?;
        tx.insert_purchase_order(&order).await?;
        enqueue_events(tx, PURCHASE_ORDER_AGGREGATE, id.into(), actor, &events).await?;
        info!(purchase_order_id = %id, po_number = order.po_number(), "purchase order registered");
        Ok(order)
    }

    async fn order_command_in(
        &self,
        tx: &mut dyn ReceivingTx,
        purchase_order_id: PurchaseOrderId,
        command: PurchaseOrderCommand,
        actor: Option<UserId>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let mut order = lock_order(tx, purchase_order_id).await?;
        let expected = ExpectedVersion::Exact(order.version());
        let events = execute(&mut order, &command)?;
        if !events.is_empty() {
            tx.update_purchase_order(&order, expected).await?;
            enqueue_events(tx, PURCHASE_ORDER_AGGREGATE, purchase_order_id.into(), actor, &events)
                .await?;
        }
        Ok(order.status())
    }

    async fn open_receipt_in(
        &self,
        tx: &mut dyn ReceivingTx,
        purchase_order_id: PurchaseOrderId,
        remarks: Option<String>,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<GoodsReceiptNote> {
        let mut order = lock_order(tx, purchase_order_id).await?;
        let grns = tx.list_grns(purchase_order_id).await?;

        let open = {
            let chain = GrnChain::new(&order, &grns)?;
            match chain.plan_seed(GrnId::new(), remarks, actor, at) {
                Ok(open) => open,
                Err(err) => {
                    let err = EngineError::from(err);
                    return Err(match chain.first() {
                        Some(first) => err.with_current(first),
                        None => err,
                    });
                }
            }
        };

        let mut grn = GoodsReceiptNote::empty(open.grn_id);
        let events = execute_grn(&mut grn, &GrnCommand::Open(open))?;
        tx.insert_grn(&grn).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn.id_typed().into(), actor, &events).await?;

        let expected = ExpectedVersion::Exact(order.version());
        let order_events =
            execute(&mut order, &PurchaseOrderCommand::RequestReceipt { occurred_at: at })?;
        if !order_events.is_empty() {
            tx.update_purchase_order(&order, expected).await?;
            enqueue_events(tx, PURCHASE_ORDER_AGGREGATE, purchase_order_id.into(), actor, &order_events)
                .await?;
        }

        info!(
            grn_id = %grn.id_typed(),
            purchase_order_id = %purchase_order_id,
            grn_number = grn.grn_number(),
            "receipt opened"
        );
        Ok(grn)
    }

    async fn record_counts_in(
        &self,
        tx: &mut dyn ReceivingTx,
        grn_id: GrnId,
        counts: Vec<LineCount>,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<ReceiptOutcome> {
        let (mut order, mut grns, idx) = load_chain_for(tx, grn_id).await?;

        let expected = ExpectedVersion::Exact(grns[idx].version());
        let command = GrnCommand::RecordCounts {
            counts,
            recorded_by: actor,
            occurred_at: at,
        };
        let events = execute_grn(&mut grns[idx], &command)?;
        GrnChain::new(&order, &grns)?.check_within_order(&grns[idx])?;

        tx.update_grn(&grns[idx], expected).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn_id.into(), actor, &events).await?;
        info!(
            grn_id = %grn_id,
            verification_status = %grns[idx].verification_status(),
            "physical counts recorded"
        );

        self.settle(tx, &mut order, &mut grns, idx, actor, at).await
    }

    async fn verify_grn_in(
        &self,
        tx: &mut dyn ReceivingTx,
        grn_id: GrnId,
        requested: VerificationStatus,
        reviewer: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<ReceiptOutcome> {
        let (mut order, mut grns, idx) = load_chain_for(tx, grn_id).await?;

        let expected = ExpectedVersion::Exact(grns[idx].version());
        let command = GrnCommand::Verify {
            requested,
            reviewer,
            occurred_at: at,
        };
        let events = execute_grn(&mut grns[idx], &command)?;
        GrnChain::new(&order, &grns)?.check_within_order(&grns[idx])?;

        tx.update_grn(&grns[idx], expected).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn_id.into(), reviewer, &events).await?;
        info!(grn_id = %grn_id, verification_status = %requested, "GRN verified");

        self.settle(tx, &mut order, &mut grns, idx, reviewer, at).await
    }

    async fn shortage_fulfillment_in(
        &self,
        tx: &mut dyn ReceivingTx,
        purchase_order_id: PurchaseOrderId,
        request: ShortageFulfillment,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<ReceiptOutcome> {
        let mut order = lock_order(tx, purchase_order_id).await?;
        let mut grns = tx.list_grns(purchase_order_id).await?;

        let ShortageFulfillment {
            supplier_name,
            remarks,
            items,
        } = request;
        let (open, counts) = GrnChain::new(&order, &grns)?.plan_shortage_fulfillment(
            GrnId::new(),
            supplier_name,
            remarks,
            &items,
            actor,
            at,
        )?;

        let mut grn = GoodsReceiptNote::empty(open.grn_id);
        let mut events = execute_grn(&mut grn, &GrnCommand::Open(open))?;
        events.extend(execute_grn(
            &mut grn,
            &GrnCommand::RecordCounts {
                counts,
                recorded_by: actor,
                occurred_at: at,
            },
        )?);
        GrnChain::new(&order, &grns)?.check_within_order(&grn)?;

        tx.insert_grn(&grn).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn.id_typed().into(), actor, &events).await?;
        info!(
            grn_id = %grn.id_typed(),
            purchase_order_id = %purchase_order_id,
            grn_number = grn.grn_number(),
            "shortage-fulfillment GRN recorded"
        );

        // Book what arrived against the claims it fulfils, oldest first.
        let mut claims = tx.list_vendor_returns(purchase_order_id).await?;
        let versions: HashMap<VendorReturnId, u64> =
            claims.iter().map(|c| (c.id_typed(), c.version())).collect();
        let claim_events = apply_fulfillment(&mut claims, &grn, at);
        let mut touched = Vec::with_capacity(claim_events.len());
        for event in &claim_events {
            let id = event.vendor_return_id();
            let Some(claim) = claims.iter().find(|c| c.id_typed() == id) else {
                continue;
            };
            let expected = versions
                .get(&id)
                .map_or(ExpectedVersion::Any, |v| ExpectedVersion::Exact(*v));
            tx.save_vendor_return(claim, expected).await?;
            enqueue_events(tx, VENDOR_RETURN_AGGREGATE, id.into(), actor, std::slice::from_ref(event))
                .await?;
            touched.push(claim.clone());
        }

        grns.push(grn);
        let idx = grns.len() - 1;
        let mut outcome = self.settle(tx, &mut order, &mut grns, idx, actor, at).await?;
        touched.append(&mut outcome.vendor_returns);
        outcome.vendor_returns = touched;
        Ok(outcome)
    }

    async fn materialize_in(
        &self,
        tx: &mut dyn ReceivingTx,
        grn_id: GrnId,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<MaterializeOutcome> {
        let (mut order, mut grns, idx) = load_chain_for(tx, grn_id).await?;

        if grns[idx].inventory_added() {
            let rows = tx.stock_for_grn(grn_id).await?;
            info!(grn_id = %grn_id, rows = rows.len(), "GRN already materialized; returning existing stock");
            return Ok(MaterializeOutcome::Replayed(rows));
        }

        let rows = self.materialize_grn(tx, &mut grns[idx], actor, at).await?;
        self.sync_status(tx, &mut order, &grns, actor, at).await?;
        Ok(MaterializeOutcome::Created(rows))
    }

    async fn resync_in(
        &self,
        tx: &mut dyn ReceivingTx,
        purchase_order_id: PurchaseOrderId,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let mut order = lock_order(tx, purchase_order_id).await?;
        let grns = tx.list_grns(purchase_order_id).await?;
        self.sync_status(tx, &mut order, &grns, actor, at).await
    }

    async fn cancel_grn_in(
        &self,
        tx: &mut dyn ReceivingTx,
        grn_id: GrnId,
        reason: String,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<GoodsReceiptNote> {
        let (_order, mut grns, idx) = load_chain_for(tx, grn_id).await?;
        let grn = &mut grns[idx];

        let expected = ExpectedVersion::Exact(grn.version());
        let command = GrnCommand::Cancel {
            reason,
            cancelled_by: actor,
            occurred_at: at,
        };
        let events = execute_grn(grn, &command)?;
        tx.update_grn(grn, expected).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn_id.into(), actor, &events).await?;
        info!(grn_id = %grn_id, "GRN cancelled");
        Ok(grns.swap_remove(idx))
    }

    async fn delete_grn_in(
        &self,
        tx: &mut dyn ReceivingTx,
        grn_id: GrnId,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let (_order, mut grns, idx) = load_chain_for(tx, grn_id).await?;
        let grn = &mut grns[idx];

        let command = GrnCommand::Delete {
            deleted_by: actor,
            occurred_at: at,
        };
        let events = execute_grn(grn, &command)?;
        tx.delete_vendor_returns_for_grn(grn_id).await?;
        tx.delete_grn(grn_id).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn_id.into(), actor, &events).await?;
        info!(grn_id = %grn_id, was_first_grn = grn.is_first_grn(), "GRN deleted");
        Ok(())
    }

    async fn chain_summary_in(
        &self,
        tx: &mut dyn ReceivingTx,
        purchase_order_id: PurchaseOrderId,
    ) -> EngineResult<ChainSummary> {
        let order = lock_order(tx, purchase_order_id).await?;
        let grns = tx.list_grns(purchase_order_id).await?;
        let vendor_returns = tx.list_vendor_returns(purchase_order_id).await?;

        let (progress, outstanding) = {
            let chain = GrnChain::new(&order, &grns)?;
            (receipt_progress(&chain), chain.outstanding())
        };
        Ok(ChainSummary {
            purchase_order_id,
            po_number: order.po_number().to_string(),
            vendor_name: order.vendor_name().to_string(),
            status: order.status(),
            progress,
            grns,
            outstanding,
            vendor_returns,
        })
    }

    /// Claim → materialize → status sync for a GRN whose counts just changed.
    async fn settle(
        &self,
        tx: &mut dyn ReceivingTx,
        order: &mut PurchaseOrder,
        grns: &mut [GoodsReceiptNote],
        idx: usize,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<ReceiptOutcome> {
        let mut vendor_returns = Vec::new();
        if grns[idx].is_reconciled() {
            if let Some(claim) = self.sync_claim(tx, &grns[idx], actor, at).await? {
                vendor_returns.push(claim);
            }
        }

        let stock = if grns[idx].inventory_added() {
            Vec::new()
        } else {
            self.materialize_grn(tx, &mut grns[idx], actor, at).await?
        };

        let purchase_order_status = self.sync_status(tx, order, grns, actor, at).await?;
        Ok(ReceiptOutcome {
            grn: grns[idx].clone(),
            vendor_returns,
            stock,
            purchase_order_status,
        })
    }

    async fn sync_claim(
        &self,
        tx: &mut dyn ReceivingTx,
        grn: &GoodsReceiptNote,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<VendorReturn>> {
        let claims = tx.list_vendor_returns(grn.purchase_order_id()).await?;
        let existing = claims.iter().find(|c| c.grn_id() == grn.id_typed());

        let (claim, event, expected) = match raise_or_update(existing, grn, VendorReturnId::new(), at)? {
            ClaimOutcome::Raised(claim, event) => (claim, event, ExpectedVersion::Any),
            ClaimOutcome::Updated(claim, event) => {
                let expected = existing.map_or(ExpectedVersion::Any, |c| {
                    ExpectedVersion::Exact(c.version())
                });
                (claim, event, expected)
            }
            ClaimOutcome::Unchanged => return Ok(None),
        };

        tx.save_vendor_return(&claim, expected).await?;
        enqueue_events(
            tx,
            VENDOR_RETURN_AGGREGATE,
            claim.id_typed().into(),
            actor,
            std::slice::from_ref(&event),
        )
        .await?;
        info!(
            grn_id = %grn.id_typed(),
            return_number = claim.return_number(),
            total_shortage_value = %claim.total_shortage_value(),
            "vendor return saved"
        );
        Ok(Some(claim))
    }

    async fn materialize_grn(
        &self,
        tx: &mut dyn ReceivingTx,
        grn: &mut GoodsReceiptNote,
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<Vec<StockEntry>> {
        let plan =
            plan_materialization(grn, actor, at).map_err(|e| EngineError::from(e).with_current(grn))?;

        if !tx.claim_materialization(grn.id_typed()).await? {
            warn!(grn_id = %grn.id_typed(), "materialization claim lost to a concurrent writer");
            return Err(EngineError::Conflict {
                kind: ConflictKind::AlreadyMaterialized,
                message: format!("inventory already added for GRN {}", grn.grn_number()),
                current: Some(Box::new(grn.clone())),
            });
        }
        tx.insert_stock(&plan.entries).await?;

        let expected = ExpectedVersion::Exact(grn.version());
        let events = execute_grn(grn, &GrnCommand::MarkMaterialized { occurred_at: at })?;
        tx.update_grn(grn, expected).await?;
        enqueue_events(tx, GRN_AGGREGATE, grn.id_typed().into(), actor, &events).await?;
        enqueue_events(
            tx,
            STOCK_AGGREGATE,
            grn.id_typed().into(),
            actor,
            std::slice::from_ref(&plan.event),
        )
        .await?;

        info!(grn_id = %grn.id_typed(), rows = plan.entries.len(), "inventory materialized");
        Ok(plan.entries)
    }

    async fn sync_status(
        &self,
        tx: &mut dyn ReceivingTx,
        order: &mut PurchaseOrder,
        grns: &[GoodsReceiptNote],
        actor: Option<UserId>,
        at: DateTime<Utc>,
    ) -> EngineResult<PurchaseOrderStatus> {
        let target = target_status(&GrnChain::new(order, grns)?);
        let Some(target) = target else {
            return Ok(order.status());
        };

        let from = order.status();
        let expected = ExpectedVersion::Exact(order.version());
        let command = PurchaseOrderCommand::AdvanceFromReceipts {
            target,
            occurred_at: at,
        };
        let events = execute(order, &command)?;
        if !events.is_empty() {
            tx.update_purchase_order(order, expected).await?;
            enqueue_events(tx, PURCHASE_ORDER_AGGREGATE, order.id_typed().into(), actor, &events)
                .await?;
            info!(
                purchase_order_id = %order.id_typed(),
                from = %from,
                to = %order.status(),
                "purchase order status advanced"
            );
        }
        Ok(order.status())
    }
}

fn execute_grn(grn: &mut GoodsReceiptNote, command: &GrnCommand) -> EngineResult<Vec<GrnEvent>> {
    execute(grn, command).map_err(|e| EngineError::from(e).with_current(grn))
}

async fn lock_order(tx: &mut dyn ReceivingTx, id: PurchaseOrderId) -> EngineResult<PurchaseOrder> {
    tx.lock_purchase_order(id)
        .await?
        .ok_or_else(|| EngineError::not_found("purchase_order", id))
}

/// Lock the chain a GRN belongs to and return it with the GRN's position.
async fn load_chain_for(
    tx: &mut dyn ReceivingTx,
    grn_id: GrnId,
) -> EngineResult<(PurchaseOrder, Vec<GoodsReceiptNote>, usize)> {
    let peek = tx
        .find_grn(grn_id)
        .await?
        .ok_or_else(|| EngineError::not_found("grn", grn_id))?;
    let order = lock_order(tx, peek.purchase_order_id()).await?;
    let grns = tx.list_grns(order.id_typed()).await?;
    let idx = grns
        .iter()
        .position(|g| g.id_typed() == grn_id)
        .ok_or_else(|| EngineError::not_found("grn", grn_id))?;
    Ok((order, grns, idx))
}

async fn enqueue_events<E>(
    tx: &mut dyn ReceivingTx,
    aggregate_type: &str,
    aggregate_id: Uuid,
    actor: Option<UserId>,
    events: &[E],
) -> EngineResult<()>
where
    E: Event + Serialize,
{
    for event in events {
        let message = OutboxMessage::from_event(aggregate_type, aggregate_id, actor, event)
            .map_err(|e| {
                EngineError::TransactionFailure(format!(
                    "failed to serialize {}: {e}",
                    event.event_type()
                ))
            })?;
        tx.enqueue(&message).await?;
    }
    Ok(())
}
