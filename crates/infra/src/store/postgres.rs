//! Postgres-backed receiving store.
//!
//! Schema lives in `migrations/0001_receiving.sql` and is applied by
//! [`PostgresReceivingStore::migrate`].
//!
//! ## Locking
//!
//! - Purchase order and GRN reads inside a transaction use `SELECT … FOR UPDATE`.
//! - Materialization is claimed with
//!   `UPDATE goods_receipt_notes SET inventory_added = TRUE WHERE id = $1 AND inventory_added = FALSE`;
//!   zero affected rows means another writer already materialized the GRN.
//! - Row updates carry `AND version = $expected`; zero affected rows is a concurrency error.
//! - The outbox relay claims rows with `FOR UPDATE SKIP LOCKED`, so several relays can
//!   drain the same table. A `processing` row whose `updated_at` is older than the
//!   relay's lease is claimed again.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Second first GRN, reused sequence, duplicate claim |
//! | Database (serialization failure) | `40001` | `Concurrency` | Concurrent transaction won |
//! | Database (deadlock detected) | `40P01` | `Concurrency` | Lock cycle broken by the server |
//! | Database (other) | Any other | `Backend` | Check / FK violations etc. |
//! | ColumnDecode / Decode | N/A | `Serialization` | Row does not match the domain type |
//! | PoolClosed / other | N/A | `Backend` | Network errors, connection failures, etc. |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use loomerp_core::{
    AggregateRoot, ExpectedVersion, GrnId, OutboxId, PurchaseOrderId, Quantity, UserId,
};
use loomerp_events::EventEnvelope;
use loomerp_inventory::{InventoryMovement, InventoryRecord, StockEntry};
use loomerp_purchasing::{PurchaseOrder, PurchaseOrderLine};
use loomerp_receiving::{GoodsReceiptNote, GrnRecord, ReceiptLine};
use loomerp_returns::{ShortageItem, VendorReturn};

use super::{ReceivingStore, ReceivingTx, StoreError};
use crate::outbox::{OutboxMessage, OutboxStatus};

const SCHEMA: &str = include_str!("../../migrations/0001_receiving.sql");

/// Longest pause between two delivery attempts of one outbox message, in seconds.
const MAX_RETRY_BACKOFF_SECS: f64 = 300.0;

macro_rules! grn_select {
    () => {
        r#"
        SELECT
            id, grn_number, purchase_order_id, vendor_id, supplier_name, grn_sequence,
            is_first_grn, original_grn_id, items_received, verification_status, status,
            inventory_added, remarks, cancellation_reason, received_by, reviewed_by,
            received_at, verified_at, version
        FROM goods_receipt_notes
        "#
    };
}

/// Postgres-backed store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresReceivingStore {
    pool: Arc<PgPool>,
}

impl PostgresReceivingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the receiving tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl ReceivingStore for PostgresReceivingStore {
    async fn begin(&self) -> Result<Box<dyn ReceivingTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTx { tx }))
    }

    #[instrument(skip(self), fields(claimed), err)]
    async fn claim_outbox(
        &self,
        batch_size: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id, status = 'processing' AS reclaimed
                FROM outbox_events
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'processing' AND updated_at <= NOW() - make_interval(secs => $2))
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE outbox_events o
            SET status = 'processing', attempts = o.attempts + 1, updated_at = NOW()
            FROM due
            WHERE o.id = due.id
            RETURNING o.id, o.envelope, o.status, o.attempts, o.last_error, o.created_at,
                      o.updated_at AS claimed_at, due.reclaimed
            "#,
        )
        .bind(i64::from(batch_size))
        .bind(lease.as_secs_f64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox", e))?;

        let mut messages = rows
            .iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map_err(|e| map_sqlx_error("claim_outbox", e))
                    .and_then(OutboxMessage::try_from)
            })
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|m| m.created_at);

        Span::current().record("claimed", messages.len());
        Ok(messages)
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_delivered(&self, id: OutboxId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'delivered', last_error = NULL, processed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn release_outbox(
        &self,
        id: OutboxId,
        error: &str,
        max_attempts: u32,
    ) -> Result<OutboxStatus, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
                last_error = $2,
                available_at = NOW() + make_interval(secs => LEAST(POWER(2, attempts), $4)),
                updated_at = NOW()
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(i64::from(max_attempts))
        .bind(MAX_RETRY_BACKOFF_SECS)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_outbox", e))?
        .ok_or_else(|| StoreError::Backend(format!("outbox message {id} not found")))?;

        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("release_outbox", e))?;
        status.parse().map_err(StoreError::Serialization)
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ReceivingTx for PostgresTx {
    #[instrument(skip(self), fields(purchase_order_id = %id), err)]
    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, po_number, vendor_id, vendor_name, status, lines, version
            FROM purchase_orders
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_purchase_order", e))?;

        row.map(|row| {
            PurchaseOrderRow::from_row(&row)
                .map_err(|e| map_sqlx_error("lock_purchase_order", e))
                .and_then(PurchaseOrder::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self, order), fields(purchase_order_id = %order.id_typed()), err)]
    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO purchase_orders (id, po_number, vendor_id, vendor_name, status, lines, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.po_number())
        .bind(order.vendor_id().as_uuid())
        .bind(order.vendor_name())
        .bind(order.status().as_str())
        .bind(Json(order.lines().to_vec()))
        .bind(order.version() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_purchase_order", e))?;
        Ok(())
    }

    #[instrument(skip(self, order), fields(purchase_order_id = %order.id_typed()), err)]
    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE purchase_orders
            SET status = $2, vendor_name = $3, lines = $4, version = $5, updated_at = NOW()
            WHERE id = $1 AND ($6::BIGINT IS NULL OR version = $6)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.status().as_str())
        .bind(order.vendor_name())
        .bind(Json(order.lines().to_vec()))
        .bind(order.version() as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_purchase_order", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "purchase order {}: expected {expected:?}",
                order.po_number()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(grn_id = %id), err)]
    async fn find_grn(&mut self, id: GrnId) -> Result<Option<GoodsReceiptNote>, StoreError> {
        let row = sqlx::query(concat!(grn_select!(), " WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_grn", e))?;

        row.map(|row| {
            GrnRow::from_row(&row)
                .map_err(|e| map_sqlx_error("find_grn", e))
                .and_then(GoodsReceiptNote::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    async fn list_grns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<GoodsReceiptNote>, StoreError> {
        let rows = sqlx::query(concat!(
            grn_select!(),
            " WHERE purchase_order_id = $1 ORDER BY grn_sequence ASC FOR UPDATE"
        ))
        .bind(purchase_order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_grns", e))?;

        rows.iter()
            .map(|row| {
                GrnRow::from_row(row)
                    .map_err(|e| map_sqlx_error("list_grns", e))
                    .and_then(GoodsReceiptNote::try_from)
            })
            .collect()
    }

    #[instrument(skip(self, grn), fields(grn_id = %grn.id_typed(), purchase_order_id = %grn.purchase_order_id()), err)]
    async fn insert_grn(&mut self, grn: &GoodsReceiptNote) -> Result<(), StoreError> {
        let r = grn.record();
        sqlx::query(
            r#"
            INSERT INTO goods_receipt_notes (
                id, grn_number, purchase_order_id, vendor_id, supplier_name, grn_sequence,
                is_first_grn, original_grn_id, items_received, verification_status, status,
                inventory_added, remarks, cancellation_reason, received_by, reviewed_by,
                received_at, verified_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(&r.grn_number)
        .bind(r.purchase_order_id.as_uuid())
        .bind(r.vendor_id.as_uuid())
        .bind(&r.supplier_name)
        .bind(r.grn_sequence as i32)
        .bind(r.is_first_grn)
        .bind(r.original_grn_id.map(Uuid::from))
        .bind(Json(r.items_received.clone()))
        .bind(r.verification_status.as_str())
        .bind(r.status.as_str())
        .bind(r.inventory_added)
        .bind(r.remarks.as_deref())
        .bind(r.cancellation_reason.as_deref())
        .bind(r.received_by.map(Uuid::from))
        .bind(r.reviewed_by.map(Uuid::from))
        .bind(r.received_at)
        .bind(r.verified_at)
        .bind(r.version as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_grn", e))?;
        Ok(())
    }

    #[instrument(skip(self, grn), fields(grn_id = %grn.id_typed(), purchase_order_id = %grn.purchase_order_id()), err)]
    async fn update_grn(
        &mut self,
        grn: &GoodsReceiptNote,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let r = grn.record();
        let result = sqlx::query(
            r#"
            UPDATE goods_receipt_notes
            SET supplier_name = $2,
                items_received = $3,
                verification_status = $4,
                status = $5,
                inventory_added = $6,
                remarks = $7,
                cancellation_reason = $8,
                received_by = $9,
                reviewed_by = $10,
                verified_at = $11,
                version = $12,
                updated_at = NOW()
            WHERE id = $1 AND ($13::BIGINT IS NULL OR version = $13)
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(&r.supplier_name)
        .bind(Json(r.items_received.clone()))
        .bind(r.verification_status.as_str())
        .bind(r.status.as_str())
        .bind(r.inventory_added)
        .bind(r.remarks.as_deref())
        .bind(r.cancellation_reason.as_deref())
        .bind(r.received_by.map(Uuid::from))
        .bind(r.reviewed_by.map(Uuid::from))
        .bind(r.verified_at)
        .bind(r.version as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_grn", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "GRN {}: expected {expected:?}",
                r.grn_number
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(grn_id = %id), err)]
    async fn delete_grn(&mut self, id: GrnId) -> Result<(), StoreError> {
        // `original_grn_id` on children is cleared by ON DELETE SET NULL.
        sqlx::query("DELETE FROM goods_receipt_notes WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_grn", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(grn_id = %id), err)]
    async fn claim_materialization(&mut self, id: GrnId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE goods_receipt_notes
            SET inventory_added = TRUE, updated_at = NOW()
            WHERE id = $1 AND inventory_added = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("claim_materialization", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, entries), fields(rows = entries.len()), err)]
    async fn insert_stock(&mut self, entries: &[StockEntry]) -> Result<(), StoreError> {
        for StockEntry { record, movement } in entries {
            sqlx::query(
                r#"
                INSERT INTO inventory (
                    id, material_name, unit, current_stock, unit_cost, quality_status,
                    stock_type, purchase_order_id, grn_id, notes, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.material_name)
            .bind(&record.unit)
            .bind(record.current_stock.value())
            .bind(record.unit_cost)
            .bind(record.quality_status.as_str())
            .bind(record.stock_type.as_str())
            .bind(record.purchase_order_id.as_uuid())
            .bind(record.grn_id.as_uuid())
            .bind(&record.notes)
            .bind(record.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_stock", e))?;

            sqlx::query(
                r#"
                INSERT INTO inventory_movements (
                    id, inventory_id, grn_id, purchase_order_id, movement_type, quantity,
                    previous_stock, new_stock, reference, created_by, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(movement.id.as_uuid())
            .bind(movement.inventory_id.as_uuid())
            .bind(movement.grn_id.as_uuid())
            .bind(movement.purchase_order_id.as_uuid())
            .bind(movement.movement_type.as_str())
            .bind(movement.quantity.value())
            .bind(movement.previous_stock.value())
            .bind(movement.new_stock.value())
            .bind(&movement.reference)
            .bind(movement.created_by.map(Uuid::from))
            .bind(movement.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_stock", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(grn_id = %id), err)]
    async fn stock_for_grn(&mut self, id: GrnId) -> Result<Vec<StockEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                i.id, i.material_name, i.unit, i.current_stock, i.unit_cost, i.quality_status,
                i.stock_type, i.purchase_order_id, i.grn_id, i.notes, i.created_at,
                m.id AS movement_id, m.movement_type, m.quantity, m.previous_stock,
                m.new_stock, m.reference, m.created_by, m.created_at AS movement_created_at
            FROM inventory i
            JOIN inventory_movements m ON m.inventory_id = i.id
            WHERE i.grn_id = $1
            ORDER BY i.created_at, i.id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("stock_for_grn", e))?;

        rows.iter()
            .map(|row| {
                StockRow::from_row(row)
                    .map_err(|e| map_sqlx_error("stock_for_grn", e))
                    .and_then(StockEntry::try_from)
            })
            .collect()
    }

    #[instrument(skip(self), fields(purchase_order_id = %purchase_order_id), err)]
    async fn list_vendor_returns(
        &mut self,
        purchase_order_id: PurchaseOrderId,
    ) -> Result<Vec<VendorReturn>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, return_number, purchase_order_id, grn_id, vendor_id, status, items,
                total_shortage_value, created_at, updated_at, version
            FROM vendor_returns
            WHERE purchase_order_id = $1
            ORDER BY created_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(purchase_order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_vendor_returns", e))?;

        rows.iter()
            .map(|row| {
                VendorReturnRow::from_row(row)
                    .map_err(|e| map_sqlx_error("list_vendor_returns", e))
                    .and_then(VendorReturn::try_from)
            })
            .collect()
    }

    #[instrument(skip(self, claim), fields(grn_id = %claim.grn_id(), purchase_order_id = %claim.purchase_order_id()), err)]
    async fn save_vendor_return(
        &mut self,
        claim: &VendorReturn,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO vendor_returns (
                id, return_number, purchase_order_id, grn_id, vendor_id, return_type, status,
                items, total_shortage_value, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                items = EXCLUDED.items,
                total_shortage_value = EXCLUDED.total_shortage_value,
                updated_at = EXCLUDED.updated_at,
                version = EXCLUDED.version
            WHERE $13::BIGINT IS NULL OR vendor_returns.version = $13
            "#,
        )
        .bind(claim.id_typed().as_uuid())
        .bind(claim.return_number())
        .bind(claim.purchase_order_id().as_uuid())
        .bind(claim.grn_id().as_uuid())
        .bind(claim.vendor_id().as_uuid())
        .bind(claim.return_type().as_str())
        .bind(claim.status().as_str())
        .bind(Json(claim.items().to_vec()))
        .bind(claim.total_shortage_value())
        .bind(claim.created_at())
        .bind(claim.updated_at())
        .bind(claim.version() as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_vendor_return", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "vendor return {}: expected {expected:?}",
                claim.return_number()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(grn_id = %grn_id), err)]
    async fn delete_vendor_returns_for_grn(&mut self, grn_id: GrnId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vendor_returns WHERE grn_id = $1")
            .bind(grn_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_vendor_returns_for_grn", e))?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(outbox_id = %message.id, event_type = message.event_type()), err)]
    async fn enqueue(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_type, aggregate_id, event_type, envelope, status, attempts, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.envelope.aggregate_type())
        .bind(message.envelope.aggregate_id())
        .bind(message.envelope.event_type())
        .bind(Json(&message.envelope))
        .bind(message.status.as_str())
        .bind(message.attempts as i32)
        .bind(message.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn expected_version(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Serialization(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {}", operation))
        }
        other => StoreError::Backend(format!("database error in {}: {}", operation, other)),
    }
}

fn decode<T, E: core::fmt::Display>(what: &str, value: Result<T, E>) -> Result<T, StoreError> {
    value.map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn quantity(field: &str, value: Decimal) -> Result<Quantity, StoreError> {
    decode(field, Quantity::new(field, value))
}

/// Internal row struct for `purchase_orders`.
struct PurchaseOrderRow {
    id: Uuid,
    po_number: String,
    vendor_id: Uuid,
    vendor_name: String,
    status: String,
    lines: Json<Vec<PurchaseOrderLine>>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for PurchaseOrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PurchaseOrderRow {
            id: row.try_get("id")?,
            po_number: row.try_get("po_number")?,
            vendor_id: row.try_get("vendor_id")?,
            vendor_name: row.try_get("vendor_name")?,
            status: row.try_get("status")?,
            lines: row.try_get("lines")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<PurchaseOrderRow> for PurchaseOrder {
    type Error = StoreError;

    fn try_from(row: PurchaseOrderRow) -> Result<Self, Self::Error> {
        Ok(PurchaseOrder::restore(
            row.id.into(),
            row.po_number,
            row.vendor_id.into(),
            row.vendor_name,
            decode("purchase_orders.status", row.status.parse())?,
            row.lines.0,
            row.version as u64,
        ))
    }
}

/// Internal row struct for `goods_receipt_notes`.
struct GrnRow {
    id: Uuid,
    grn_number: String,
    purchase_order_id: Uuid,
    vendor_id: Uuid,
    supplier_name: String,
    grn_sequence: i32,
    is_first_grn: bool,
    original_grn_id: Option<Uuid>,
    items_received: Json<Vec<ReceiptLine>>,
    verification_status: String,
    status: String,
    inventory_added: bool,
    remarks: Option<String>,
    cancellation_reason: Option<String>,
    received_by: Option<Uuid>,
    reviewed_by: Option<Uuid>,
    received_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for GrnRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(GrnRow {
            id: row.try_get("id")?,
            grn_number: row.try_get("grn_number")?,
            purchase_order_id: row.try_get("purchase_order_id")?,
            vendor_id: row.try_get("vendor_id")?,
            supplier_name: row.try_get("supplier_name")?,
            grn_sequence: row.try_get("grn_sequence")?,
            is_first_grn: row.try_get("is_first_grn")?,
            original_grn_id: row.try_get("original_grn_id")?,
            items_received: row.try_get("items_received")?,
            verification_status: row.try_get("verification_status")?,
            status: row.try_get("status")?,
            inventory_added: row.try_get("inventory_added")?,
            remarks: row.try_get("remarks")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
            received_by: row.try_get("received_by")?,
            reviewed_by: row.try_get("reviewed_by")?,
            received_at: row.try_get("received_at")?,
            verified_at: row.try_get("verified_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<GrnRow> for GoodsReceiptNote {
    type Error = StoreError;

    fn try_from(row: GrnRow) -> Result<Self, Self::Error> {
        let record = GrnRecord {
            id: row.id.into(),
            grn_number: row.grn_number,
            purchase_order_id: row.purchase_order_id.into(),
            vendor_id: row.vendor_id.into(),
            supplier_name: row.supplier_name,
            grn_sequence: decode("goods_receipt_notes.grn_sequence", u32::try_from(row.grn_sequence))?,
            is_first_grn: row.is_first_grn,
            original_grn_id: row.original_grn_id.map(GrnId::from),
            items_received: row.items_received.0,
            verification_status: decode(
                "goods_receipt_notes.verification_status",
                row.verification_status.parse(),
            )?,
            status: decode("goods_receipt_notes.status", row.status.parse())?,
            inventory_added: row.inventory_added,
            remarks: row.remarks,
            cancellation_reason: row.cancellation_reason,
            received_by: row.received_by.map(UserId::from),
            reviewed_by: row.reviewed_by.map(UserId::from),
            received_at: row.received_at,
            verified_at: row.verified_at,
            version: row.version as u64,
        };
        decode("goods_receipt_notes", GoodsReceiptNote::restore(record))
    }
}

/// Internal row struct for an `inventory` row joined with its movement.
struct StockRow {
    id: Uuid,
    material_name: String,
    unit: String,
    current_stock: Decimal,
    unit_cost: Decimal,
    quality_status: String,
    stock_type: String,
    purchase_order_id: Uuid,
    grn_id: Uuid,
    notes: String,
    created_at: DateTime<Utc>,
    movement_id: Uuid,
    movement_type: String,
    quantity: Decimal,
    previous_stock: Decimal,
    new_stock: Decimal,
    reference: String,
    created_by: Option<Uuid>,
    movement_created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for StockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockRow {
            id: row.try_get("id")?,
            material_name: row.try_get("material_name")?,
            unit: row.try_get("unit")?,
            current_stock: row.try_get("current_stock")?,
            unit_cost: row.try_get("unit_cost")?,
            quality_status: row.try_get("quality_status")?,
            stock_type: row.try_get("stock_type")?,
            purchase_order_id: row.try_get("purchase_order_id")?,
            grn_id: row.try_get("grn_id")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            movement_id: row.try_get("movement_id")?,
            movement_type: row.try_get("movement_type")?,
            quantity: row.try_get("quantity")?,
            previous_stock: row.try_get("previous_stock")?,
            new_stock: row.try_get("new_stock")?,
            reference: row.try_get("reference")?,
            created_by: row.try_get("created_by")?,
            movement_created_at: row.try_get("movement_created_at")?,
        })
    }
}

impl TryFrom<StockRow> for StockEntry {
    type Error = StoreError;

    fn try_from(row: StockRow) -> Result<Self, Self::Error> {
        let record = InventoryRecord {
            id: row.id.into(),
            material_name: row.material_name,
            unit: row.unit,
            current_stock: quantity("inventory.current_stock", row.current_stock)?,
            unit_cost: row.unit_cost,
            quality_status: decode("inventory.quality_status", row.quality_status.parse())?,
            stock_type: decode("inventory.stock_type", row.stock_type.parse())?,
            purchase_order_id: row.purchase_order_id.into(),
            grn_id: row.grn_id.into(),
            notes: row.notes,
            created_at: row.created_at,
        };
        let movement = InventoryMovement {
            id: row.movement_id.into(),
            inventory_id: record.id,
            grn_id: record.grn_id,
            purchase_order_id: record.purchase_order_id,
            movement_type: decode("inventory_movements.movement_type", row.movement_type.parse())?,
            quantity: quantity("inventory_movements.quantity", row.quantity)?,
            previous_stock: quantity("inventory_movements.previous_stock", row.previous_stock)?,
            new_stock: quantity("inventory_movements.new_stock", row.new_stock)?,
            reference: row.reference,
            created_by: row.created_by.map(UserId::from),
            created_at: row.movement_created_at,
        };
        Ok(StockEntry { record, movement })
    }
}

/// Internal row struct for `vendor_returns`.
struct VendorReturnRow {
    id: Uuid,
    return_number: String,
    purchase_order_id: Uuid,
    grn_id: Uuid,
    vendor_id: Uuid,
    status: String,
    items: Json<Vec<ShortageItem>>,
    total_shortage_value: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for VendorReturnRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(VendorReturnRow {
            id: row.try_get("id")?,
            return_number: row.try_get("return_number")?,
            purchase_order_id: row.try_get("purchase_order_id")?,
            grn_id: row.try_get("grn_id")?,
            vendor_id: row.try_get("vendor_id")?,
            status: row.try_get("status")?,
            items: row.try_get("items")?,
            total_shortage_value: row.try_get("total_shortage_value")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<VendorReturnRow> for VendorReturn {
    type Error = StoreError;

    fn try_from(row: VendorReturnRow) -> Result<Self, Self::Error> {
        let claim = VendorReturn::restore(
            row.id.into(),
            row.return_number,
            row.purchase_order_id.into(),
            row.grn_id.into(),
            row.vendor_id.into(),
            decode("vendor_returns.status", row.status.parse())?,
            row.items.0,
            row.total_shortage_value,
            row.created_at,
            row.updated_at,
            row.version as u64,
        );
        decode("vendor_returns", claim)
    }
}

/// Internal row struct for `outbox_events`.
struct OutboxRow {
    id: Uuid,
    envelope: Json<EventEnvelope>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    reclaimed: bool,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            envelope: row.try_get("envelope")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            reclaimed: row.try_get("reclaimed")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxMessage {
            id: row.id.into(),
            envelope: row.envelope.0,
            status: row.status.parse().map_err(StoreError::Serialization)?,
            attempts: decode("outbox_events.attempts", u32::try_from(row.attempts))?,
            last_error: row.last_error,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            reclaimed: row.reclaimed,
        })
    }
}
