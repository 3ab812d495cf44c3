//! Engine tests against the in-memory store.
//!
//! Covers the receiving flow end to end: open → count → claim → materialize →
//! status sync, shortage fulfillment, idempotent materialization, rollback and
//! outbox delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use loomerp_core::{ConflictKind, PurchaseOrderId, Quantity, UserId, VendorId};
use loomerp_inventory::QualityStatus;
use loomerp_purchasing::{CreatePurchaseOrder, NewPurchaseOrderLine, PurchaseOrderStatus};
use loomerp_receiving::{
    GrnStatus, LineCount, ShortageReceiptLine, VerificationStatus, validate_lineage,
};
use loomerp_returns::ReturnStatus;

use crate::engine::{EngineError, ReceivingEngine, ShortageFulfillment};
use crate::notification::InMemoryNotificationSink;
use crate::outbox::{OutboxRelay, OutboxStatus};
use crate::store::{InMemoryReceivingStore, ReceivingStore};

type Engine = ReceivingEngine<InMemoryReceivingStore>;

fn engine() -> (Engine, Arc<InMemoryReceivingStore>) {
    let store = Arc::new(InMemoryReceivingStore::new());
    (ReceivingEngine::new(store.clone()), store)
}

fn line(material: &str, unit: &str, ordered: u32, rate: Decimal) -> NewPurchaseOrderLine {
    NewPurchaseOrderLine {
        material_name: material.to_string(),
        unit: unit.to_string(),
        ordered_quantity: Quantity::from(ordered),
        rate,
    }
}

/// Registers and approves an order with the given lines.
async fn approved_order(engine: &Engine, po_number: &str, lines: Vec<NewPurchaseOrderLine>) -> PurchaseOrderId {
    let id = PurchaseOrderId::new();
    engine
        .register_purchase_order(
            CreatePurchaseOrder {
                order_id: id,
                po_number: po_number.to_string(),
                vendor_id: VendorId::new(),
                vendor_name: "Indigo Mills".to_string(),
                lines,
                occurred_at: Utc::now(),
            },
            None,
        )
        .await
        .unwrap();
    engine.approve_purchase_order(id, None).await.unwrap();
    id
}

async fn denim_order(engine: &Engine) -> PurchaseOrderId {
    approved_order(engine, "PO-2024-001", vec![line("Denim", "m", 100, dec!(50))]).await
}

fn count(material: &str, invoiced: Decimal, received: Decimal) -> LineCount {
    LineCount {
        material_name: material.to_string(),
        invoiced_quantity: invoiced,
        received_quantity: received,
    }
}

#[tokio::test]
async fn short_delivery_raises_claim_quarantines_stock_and_marks_partial() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let actor = Some(UserId::new());

    let grn = engine.open_receipt(po, None, actor).await.unwrap();
    assert_eq!(grn.grn_number(), "GRN-PO-2024-001-01");
    assert!(grn.is_first_grn());
    assert_eq!(
        store.purchase_order(po).await.unwrap().status(),
        PurchaseOrderStatus::GrnRequested
    );

    let outcome = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], actor)
        .await
        .unwrap();

    let line = &outcome.grn.items()[0];
    assert_eq!(line.shortage_quantity, Quantity::from(15));
    assert_eq!(outcome.grn.verification_status(), VerificationStatus::Discrepancy);
    assert!(outcome.grn.inventory_added());
    assert_eq!(outcome.grn.status(), GrnStatus::Completed);

    assert_eq!(outcome.stock.len(), 1);
    let record = &outcome.stock[0].record;
    assert_eq!(record.current_stock, Quantity::from(85));
    assert_eq!(record.quality_status, QualityStatus::Quarantine);
    assert_eq!(outcome.stock[0].movement.quantity, Quantity::from(85));
    assert_eq!(outcome.stock[0].movement.previous_stock, Quantity::ZERO);

    assert_eq!(outcome.vendor_returns.len(), 1);
    let claim = &outcome.vendor_returns[0];
    assert_eq!(claim.total_shortage_value(), dec!(750));
    assert_eq!(claim.status(), ReturnStatus::Pending);
    assert_eq!(claim.grn_id(), grn.id_typed());

    assert_eq!(outcome.purchase_order_status, PurchaseOrderStatus::PartialReceived);
    assert_eq!(store.stock().await.len(), 1);
    assert_eq!(store.vendor_returns().await.len(), 1);
}

#[tokio::test]
async fn shortage_fulfillment_completes_the_order_and_fulfils_the_claim() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let first = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(first.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();

    let outcome = engine
        .create_shortage_fulfillment(
            po,
            ShortageFulfillment {
                supplier_name: None,
                remarks: Some("balance of short delivery".to_string()),
                items: vec![ShortageReceiptLine {
                    material_name: "Denim".to_string(),
                    ordered_quantity: dec!(15),
                    invoiced_quantity: dec!(15),
                    received_quantity: dec!(15),
                }],
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.grn.grn_sequence(), 2);
    assert!(!outcome.grn.is_first_grn());
    assert_eq!(outcome.grn.original_grn_id(), Some(first.id_typed()));
    assert_eq!(outcome.grn.items()[0].shortage_quantity, Quantity::ZERO);
    assert_eq!(outcome.grn.verification_status(), VerificationStatus::Verified);

    assert_eq!(outcome.stock.len(), 1);
    assert_eq!(outcome.stock[0].record.current_stock, Quantity::from(15));
    assert_eq!(outcome.stock[0].record.quality_status, QualityStatus::Approved);
    assert_eq!(outcome.purchase_order_status, PurchaseOrderStatus::Received);

    assert_eq!(outcome.vendor_returns.len(), 1);
    let claim = &outcome.vendor_returns[0];
    assert_eq!(claim.grn_id(), first.id_typed());
    assert_eq!(claim.items()[0].fulfilled_quantity, Quantity::from(15));
    assert!(claim.items()[0].outstanding().is_zero());

    assert_eq!(store.stock().await.len(), 2);
    let summary = engine.chain_summary(po).await.unwrap();
    assert_eq!(summary.grns.len(), 2);
    assert!(summary.outstanding.iter().all(|l| l.outstanding_quantity.is_zero()));
    validate_lineage(&summary.grns).unwrap();
}

#[tokio::test]
async fn materializing_twice_returns_the_original_rows() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    let first = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();
    let outbox_before = store.outbox().await.len();

    let replay = engine.materialize(grn.id_typed(), None).await.unwrap();

    assert!(replay.is_replay());
    assert_eq!(replay.entries(), first.stock.as_slice());
    assert_eq!(store.stock().await.len(), 1);
    assert_eq!(store.outbox().await.len(), outbox_before);
}

#[tokio::test]
async fn lost_materialization_claim_conflicts_and_rolls_back() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    let outbox_before = store.outbox().await.len();
    store.lose_materialization_claims();

    let err = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap_err();

    match err {
        EngineError::Conflict { kind, current, .. } => {
            assert_eq!(kind, ConflictKind::AlreadyMaterialized);
            assert_eq!(current.map(|g| g.id_typed()), Some(grn.id_typed()));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(store.stock().await.is_empty());
    assert!(store.vendor_returns().await.is_empty());
    assert_eq!(store.outbox().await.len(), outbox_before);
    let stored = store.grn(grn.id_typed()).await.unwrap();
    assert_eq!(stored.verification_status, VerificationStatus::Pending);
    assert!(!stored.inventory_added);
    assert_eq!(
        store.purchase_order(po).await.unwrap().status(),
        PurchaseOrderStatus::GrnRequested
    );

    let err = engine.materialize(grn.id_typed(), None).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyMaterialized));
    assert!(store.stock().await.is_empty());
}

#[tokio::test]
async fn second_first_grn_is_rejected_with_the_current_one() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let err = engine.open_receipt(po, None, None).await.unwrap_err();

    match err {
        EngineError::Conflict { kind, current, .. } => {
            assert_eq!(kind, ConflictKind::DuplicateGrn);
            assert_eq!(current.map(|g| g.id_typed()), Some(grn.id_typed()));
        }
        other => panic!("expected duplicate GRN conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn verifying_a_decided_grn_conflicts() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(100))], None)
        .await
        .unwrap();

    let err = engine
        .verify_grn(grn.id_typed(), VerificationStatus::Discrepancy, None)
        .await
        .unwrap_err();

    assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyVerified));
    if let EngineError::Conflict { current: Some(current), .. } = err {
        assert_eq!(current.verification_status(), VerificationStatus::Verified);
    } else {
        panic!("conflict should carry the current GRN");
    }
}

#[tokio::test]
async fn verifying_placeholder_counts_receives_the_whole_order() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    let reviewer = Some(UserId::new());

    let outcome = engine
        .verify_grn(grn.id_typed(), VerificationStatus::Verified, reviewer)
        .await
        .unwrap();

    assert_eq!(outcome.grn.verification_status(), VerificationStatus::Verified);
    assert!(outcome.vendor_returns.is_empty());
    assert_eq!(outcome.stock[0].record.current_stock, Quantity::from(100));
    assert_eq!(outcome.stock[0].record.quality_status, QualityStatus::Approved);
    assert_eq!(outcome.purchase_order_status, PurchaseOrderStatus::Received);

    let status = engine.mark_fulfilled(po, None).await.unwrap();
    assert_eq!(status, PurchaseOrderStatus::Completed);
    assert_eq!(store.purchase_order(po).await.unwrap().status(), PurchaseOrderStatus::Completed);
}

#[tokio::test]
async fn over_receipt_is_a_validation_error_and_nothing_is_written() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let err = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(120), dec!(120))], None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "items[0].received_quantity"));
    let stored = store.grn(grn.id_typed()).await.unwrap();
    assert_eq!(stored.verification_status, VerificationStatus::Pending);
    assert!(store.stock().await.is_empty());
}

#[tokio::test]
async fn overage_beyond_the_invoice_is_accepted() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let outcome = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(104))], None)
        .await
        .unwrap();

    assert_eq!(outcome.grn.items()[0].overage_quantity, Quantity::from(4));
    assert_eq!(outcome.grn.verification_status(), VerificationStatus::Discrepancy);
    assert!(outcome.vendor_returns.is_empty());
    assert_eq!(outcome.stock[0].record.current_stock, Quantity::from(104));
    assert_eq!(outcome.purchase_order_status, PurchaseOrderStatus::Received);
}

#[tokio::test]
async fn clean_receipt_against_a_smaller_invoice_receives_the_order() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let outcome = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(90), dec!(90))], None)
        .await
        .unwrap();

    assert_eq!(outcome.grn.verification_status(), VerificationStatus::Verified);
    assert!(outcome.vendor_returns.is_empty());
    assert_eq!(outcome.stock[0].record.quality_status, QualityStatus::Approved);
    assert_eq!(outcome.purchase_order_status, PurchaseOrderStatus::Received);
    assert_eq!(engine.sync_purchase_order(po, None).await.unwrap(), PurchaseOrderStatus::Received);

    let summary = engine.chain_summary(po).await.unwrap();
    assert_eq!(summary.outstanding[0].outstanding_quantity, Quantity::from(10));
    assert_eq!(summary.outstanding[0].unresolved_shortage, Quantity::ZERO);

    let status = engine.mark_fulfilled(po, None).await.unwrap();
    assert_eq!(status, PurchaseOrderStatus::Completed);
    assert_eq!(store.purchase_order(po).await.unwrap().status(), PurchaseOrderStatus::Completed);
}

#[tokio::test]
async fn negative_count_names_the_field() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let err = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(-1))], None)
        .await
        .unwrap_err();

    match err {
        EngineError::Validation { field, .. } => assert!(field.ends_with("received_quantity")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_commit_rolls_everything_back() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    let outbox_before = store.outbox().await.len();

    store.fail_next_commit();
    let err = engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::TransactionFailure(_)));
    let stored = store.grn(grn.id_typed()).await.unwrap();
    assert_eq!(stored.verification_status, VerificationStatus::Pending);
    assert!(!stored.inventory_added);
    assert!(store.stock().await.is_empty());
    assert!(store.vendor_returns().await.is_empty());
    assert_eq!(store.outbox().await.len(), outbox_before);
    assert_eq!(
        store.purchase_order(po).await.unwrap().status(),
        PurchaseOrderStatus::GrnRequested
    );

    // The same request succeeds once the store recovers.
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();
    assert_eq!(store.stock().await.len(), 1);
}

#[tokio::test]
async fn fulfillment_without_an_open_shortage_is_rejected() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    engine.open_receipt(po, None, None).await.unwrap();

    let err = engine
        .create_shortage_fulfillment(
            po,
            ShortageFulfillment {
                supplier_name: None,
                remarks: None,
                items: vec![ShortageReceiptLine {
                    material_name: "Denim".to_string(),
                    ordered_quantity: dec!(10),
                    invoiced_quantity: dec!(10),
                    received_quantity: dec!(10),
                }],
            },
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(err.conflict_kind(), Some(ConflictKind::InvalidTransition));
}

#[tokio::test]
async fn fulfillment_cannot_exceed_the_outstanding_quantity() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();

    let err = engine
        .create_shortage_fulfillment(
            po,
            ShortageFulfillment {
                supplier_name: None,
                remarks: None,
                items: vec![ShortageReceiptLine {
                    material_name: "Denim".to_string(),
                    ordered_quantity: dec!(20),
                    invoiced_quantity: dec!(20),
                    received_quantity: dec!(20),
                }],
            },
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "items[0].ordered_quantity"));
}

#[tokio::test]
async fn partial_fulfillment_keeps_the_order_partially_received() {
    let (engine, _store) = engine();
    let po = approved_order(
        &engine,
        "PO-2024-002",
        vec![line("Denim", "m", 100, dec!(50)), line("Rivets", "pcs", 500, dec!(0.2))],
    )
    .await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    let first = engine
        .record_counts(
            grn.id_typed(),
            vec![
                count("Denim", dec!(100), dec!(85)),
                count("Rivets", dec!(500), dec!(450)),
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.vendor_returns[0].total_shortage_value(), dec!(760.0));

    let second = engine
        .create_shortage_fulfillment(
            po,
            ShortageFulfillment {
                supplier_name: Some("Indigo Mills Depot".to_string()),
                remarks: None,
                items: vec![ShortageReceiptLine {
                    material_name: "Denim".to_string(),
                    ordered_quantity: dec!(15),
                    invoiced_quantity: dec!(15),
                    received_quantity: dec!(15),
                }],
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(second.grn.supplier_name(), "Indigo Mills Depot");
    assert_eq!(second.purchase_order_status, PurchaseOrderStatus::PartialReceived);
    let claim = &second.vendor_returns[0];
    let rivets = claim.items().iter().find(|i| i.material_name == "Rivets").unwrap();
    assert_eq!(rivets.outstanding(), Quantity::from(50));

    let summary = engine.chain_summary(po).await.unwrap();
    let outstanding: Vec<_> = summary
        .outstanding
        .iter()
        .map(|l| (l.material_name.as_str(), l.outstanding_quantity))
        .collect();
    assert_eq!(outstanding, vec![("Denim", Quantity::ZERO), ("Rivets", Quantity::from(50))]);
}

#[tokio::test]
async fn cancelled_grn_can_be_deleted_and_the_order_reseeded() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();

    let cancelled = engine
        .cancel_grn(grn.id_typed(), "wrong truck".to_string(), None)
        .await
        .unwrap();
    assert_eq!(cancelled.status(), GrnStatus::Cancelled);

    let err = engine.open_receipt(po, None, None).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateGrn));

    engine.delete_grn(grn.id_typed(), None).await.unwrap();
    assert!(store.grn(grn.id_typed()).await.is_none());

    let reseeded = engine.open_receipt(po, None, None).await.unwrap();
    assert!(reseeded.is_first_grn());
    assert_ne!(reseeded.id_typed(), grn.id_typed());

    let event_types: Vec<String> = store
        .outbox()
        .await
        .iter()
        .map(|m| m.event_type().to_string())
        .collect();
    assert!(event_types.contains(&"receiving.grn.cancelled".to_string()));
    assert!(event_types.contains(&"receiving.grn.deleted".to_string()));
}

#[tokio::test]
async fn materialized_grn_cannot_be_deleted() {
    let (engine, store) = engine();
    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();

    let err = engine.delete_grn(grn.id_typed(), None).await.unwrap_err();

    assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyMaterialized));
    assert!(store.grn(grn.id_typed()).await.is_some());
    assert_eq!(store.vendor_returns().await.len(), 1);
}

#[tokio::test]
async fn receipts_require_an_approved_order() {
    let (engine, _store) = engine();
    let id = PurchaseOrderId::new();
    engine
        .register_purchase_order(
            CreatePurchaseOrder {
                order_id: id,
                po_number: "PO-DRAFT".to_string(),
                vendor_id: VendorId::new(),
                vendor_name: "Indigo Mills".to_string(),
                lines: vec![line("Denim", "m", 10, dec!(50))],
                occurred_at: Utc::now(),
            },
            None,
        )
        .await
        .unwrap();

    let err = engine.open_receipt(id, None, None).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::InvalidTransition));

    let missing = engine.open_receipt(PurchaseOrderId::new(), None, None).await.unwrap_err();
    assert!(matches!(missing, EngineError::NotFound { entity: "purchase_order", .. }));
}

#[tokio::test]
async fn cancelled_order_stops_receiving() {
    let (engine, _store) = engine();
    let po = denim_order(&engine).await;

    let status = engine
        .cancel_purchase_order(po, "vendor withdrew".to_string(), None)
        .await
        .unwrap();
    assert_eq!(status, PurchaseOrderStatus::Cancelled);

    let err = engine.open_receipt(po, None, None).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::InvalidTransition));
}

#[tokio::test]
async fn committed_events_are_delivered_after_commit() {
    let store = Arc::new(InMemoryReceivingStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let relay = Arc::new(OutboxRelay::new(store.clone(), sink.clone(), 50, 3));
    let engine = ReceivingEngine::new(store.clone()).with_relay(relay);

    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();

    let delivered = sink.delivered();
    let triggers: Vec<&str> = delivered.iter().map(|(_, r)| r.trigger_event.as_str()).collect();
    assert!(triggers.contains(&"receiving.grn.opened"));
    assert!(triggers.contains(&"receiving.grn.counts_recorded"));
    assert!(triggers.contains(&"returns.vendor_return.raised"));
    assert!(triggers.contains(&"inventory.grn.materialized"));

    let discrepancy = delivered
        .iter()
        .find(|(_, r)| r.trigger_event == "receiving.grn.counts_recorded")
        .unwrap();
    assert_eq!(discrepancy.1.recipient_department, "procurement");
    assert_eq!(discrepancy.1.related_entity_id, *grn.id_typed().as_uuid());

    assert!(
        store
            .outbox()
            .await
            .iter()
            .all(|m| m.status == OutboxStatus::Delivered)
    );
}

#[tokio::test]
async fn failed_deliveries_are_retried_then_parked() {
    let store = Arc::new(InMemoryReceivingStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let relay = OutboxRelay::new(store.clone(), sink.clone(), 50, 2);
    let engine = ReceivingEngine::new(store.clone());

    let po = denim_order(&engine).await;
    engine.open_receipt(po, None, None).await.unwrap();

    sink.fail_next(100);
    let first = relay.drain_once().await.unwrap();
    assert_eq!(first.delivered, 0);
    assert!(first.retried > 0);
    assert_eq!(first.failed, 0);

    let second = relay.drain_once().await.unwrap();
    assert_eq!(second.failed, first.retried);
    let parked = store
        .outbox()
        .await
        .into_iter()
        .filter(|m| m.status == OutboxStatus::Failed)
        .collect::<Vec<_>>();
    assert_eq!(parked.len(), first.retried);
    assert!(parked.iter().all(|m| m.attempts == 2 && m.last_error.is_some()));

    sink.fail_next(0);
    let third = relay.drain_once().await.unwrap();
    assert_eq!(third.claimed, 0);
}

#[tokio::test]
async fn transient_delivery_failure_is_recovered() {
    let store = Arc::new(InMemoryReceivingStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let relay = OutboxRelay::new(store.clone(), sink.clone(), 50, 5);
    let engine = ReceivingEngine::new(store.clone());

    let po = denim_order(&engine).await;
    engine.open_receipt(po, None, None).await.unwrap();

    sink.fail_next(1);
    let first = relay.drain_once().await.unwrap();
    assert_eq!(first.retried, 1);

    let second = relay.drain_once().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.delivered, 1);
    assert!(
        store
            .outbox()
            .await
            .iter()
            .all(|m| m.status == OutboxStatus::Delivered)
    );
}

#[tokio::test]
async fn abandoned_claims_are_reclaimed_after_their_lease() {
    let store = Arc::new(InMemoryReceivingStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let engine = ReceivingEngine::new(store.clone());

    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();

    // A relay claims a batch and dies before acknowledging any of it.
    let abandoned = store.claim_outbox(50, Duration::from_secs(60)).await.unwrap();
    assert!(!abandoned.is_empty());

    let patient = OutboxRelay::new(store.clone(), sink.clone(), 50, 5);
    let early = patient.drain_once().await.unwrap();
    assert_eq!(early.claimed, 0);

    let relay = OutboxRelay::new(store.clone(), sink.clone(), 50, 5).with_lease(Duration::ZERO);
    let report = relay.drain_once().await.unwrap();
    assert_eq!(report.claimed, abandoned.len());
    assert_eq!(report.reclaimed, abandoned.len());
    assert_eq!(report.delivered + report.skipped, abandoned.len());
    assert!(
        store
            .outbox()
            .await
            .iter()
            .all(|m| m.status == OutboxStatus::Delivered && m.attempts == 2)
    );
}

#[tokio::test]
async fn failed_acknowledgement_does_not_strand_the_rest_of_the_batch() {
    let store = Arc::new(InMemoryReceivingStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let relay = OutboxRelay::new(store.clone(), sink.clone(), 50, 5).with_lease(Duration::ZERO);
    let engine = ReceivingEngine::new(store.clone());

    let po = denim_order(&engine).await;
    let grn = engine.open_receipt(po, None, None).await.unwrap();
    engine
        .record_counts(grn.id_typed(), vec![count("Denim", dec!(100), dec!(85))], None)
        .await
        .unwrap();
    let total = store.outbox().await.len();

    store.fail_next_acks(1);
    let first = relay.drain_once().await.unwrap();
    assert_eq!(first.claimed, total);
    assert_eq!(first.unacknowledged, 1);
    assert_eq!(first.delivered + first.skipped, total - 1);
    let in_flight: Vec<_> = store
        .outbox()
        .await
        .into_iter()
        .filter(|m| m.status == OutboxStatus::Processing)
        .collect();
    assert_eq!(in_flight.len(), 1);

    let second = relay.drain_once().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.reclaimed, 1);
    assert!(
        store
            .outbox()
            .await
            .iter()
            .all(|m| m.status == OutboxStatus::Delivered)
    );
}
