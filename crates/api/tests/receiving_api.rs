use std::sync::Arc;

use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use loomerp_core::{PurchaseOrderId, Quantity, UserId, VendorId};
use loomerp_infra::{InMemoryReceivingStore, ReceivingEngine};
use loomerp_purchasing::{CreatePurchaseOrder, NewPurchaseOrderLine};

struct TestServer {
    base_url: String,
    engine: Arc<ReceivingEngine<InMemoryReceivingStore>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over an in-memory engine, bound to an ephemeral port.
        let store = Arc::new(InMemoryReceivingStore::new());
        let engine = Arc::new(ReceivingEngine::new(store));
        let app = loomerp_api::app::build_app(engine.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            engine,
            handle,
        }
    }

    /// Purchase orders arrive from procurement; there is no HTTP route for them.
    async fn approved_order(&self, po_number: &str) -> PurchaseOrderId {
        let id = PurchaseOrderId::new();
        self.engine
            .register_purchase_order(
                CreatePurchaseOrder {
                    order_id: id,
                    po_number: po_number.to_string(),
                    vendor_id: VendorId::new(),
                    vendor_name: "Indigo Mills".to_string(),
                    lines: vec![NewPurchaseOrderLine {
                        material_name: "Denim".to_string(),
                        unit: "m".to_string(),
                        ordered_quantity: Quantity::from(100),
                        rate: dec!(50),
                    }],
                    occurred_at: Utc::now(),
                },
                None,
            )
            .await
            .unwrap();
        self.engine.approve_purchase_order(id, None).await.unwrap();
        id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn open_first_grn(client: &reqwest::Client, server: &TestServer, po: PurchaseOrderId) -> String {
    let res = client
        .post(server.url(&format!("/purchase-orders/{po}/receipts")))
        .json(&json!({ "remarks": "truck 7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let grn: Value = res.json().await.unwrap();
    grn["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn short_delivery_then_fulfillment_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7001").await;
    let actor = UserId::new();

    let grn_id = open_first_grn(&client, &server, po).await;

    let res = client
        .post(server.url(&format!("/grns/{grn_id}/counts")))
        .header("x-actor-id", actor.to_string())
        .json(&json!({
            "items": [{ "material_name": "Denim", "invoiced_quantity": 100, "received_quantity": 85 }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["grn"]["verification_status"], "discrepancy");
    assert_eq!(outcome["grn"]["received_by"], actor.to_string());
    assert_eq!(outcome["stock"][0]["record"]["current_stock"], "85");
    assert_eq!(outcome["stock"][0]["record"]["quality_status"], "quarantine");
    assert_eq!(outcome["vendor_returns"][0]["total_shortage_value"], "750");
    assert_eq!(outcome["purchase_order_status"], "partial_received");

    let res = client
        .post(server.url(&format!("/purchase-orders/{po}/shortage-receipts")))
        .json(&json!({
            "items": [{
                "material_name": "Denim",
                "ordered_quantity": 15,
                "invoiced_quantity": 15,
                "received_quantity": 15
            }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["grn"]["grn_sequence"], 2);
    assert_eq!(outcome["grn"]["original_grn_id"], grn_id.as_str());
    assert_eq!(outcome["stock"][0]["record"]["quality_status"], "approved");
    assert_eq!(outcome["purchase_order_status"], "received");

    let res = client
        .get(server.url(&format!("/purchase-orders/{po}/receipts")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let summary: Value = res.json().await.unwrap();
    assert_eq!(summary["grns"].as_array().unwrap().len(), 2);
    assert_eq!(summary["progress"], "complete");
    assert_eq!(summary["outstanding"][0]["outstanding_quantity"], "0");

    let res = client
        .post(server.url(&format!("/purchase-orders/{po}/fulfil")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn materialize_replays_existing_rows() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7002").await;
    let grn_id = open_first_grn(&client, &server, po).await;

    // Materializing a pending GRN parks the stock for inspection.
    let res = client
        .post(server.url(&format!("/grns/{grn_id}/materialize")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let first: Value = res.json().await.unwrap();
    assert_eq!(first["replayed"], false);
    assert_eq!(first["stock"][0]["record"]["quality_status"], "pending_inspection");

    let res = client
        .post(server.url(&format!("/grns/{grn_id}/materialize")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second: Value = res.json().await.unwrap();
    assert_eq!(second["replayed"], true);
    assert_eq!(second["stock"], first["stock"]);
}

#[tokio::test]
async fn duplicate_first_grn_is_a_conflict_with_current_state() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7003").await;
    let grn_id = open_first_grn(&client, &server, po).await;

    let res = client
        .post(server.url(&format!("/purchase-orders/{po}/receipts")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["kind"], "duplicate_grn");
    assert_eq!(body["current"]["id"], grn_id.as_str());
}

#[tokio::test]
async fn verify_rejects_pending_and_repeat_decisions() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7004").await;
    let grn_id = open_first_grn(&client, &server, po).await;
    let verify = server.url(&format!("/grns/{grn_id}/verify"));

    let res = client
        .post(&verify)
        .json(&json!({ "verification_status": "pending" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["field"], "verification_status");

    let res = client
        .post(&verify)
        .json(&json!({ "verification_status": "verified" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(&verify)
        .json(&json!({ "verification_status": "discrepancy" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "already_verified");
    assert_eq!(body["current"]["verification_status"], "verified");
}

#[tokio::test]
async fn verify_records_the_reviewer_from_the_body_or_the_header() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let reviewer = UserId::new();

    let po = server.approved_order("PO-7007").await;
    let grn_id = open_first_grn(&client, &server, po).await;
    let res = client
        .post(server.url(&format!("/grns/{grn_id}/verify")))
        .json(&json!({ "verification_status": "verified", "reviewer_id": reviewer.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["grn"]["reviewed_by"], reviewer.to_string());

    let po = server.approved_order("PO-7008").await;
    let grn_id = open_first_grn(&client, &server, po).await;
    let res = client
        .post(server.url(&format!("/grns/{grn_id}/verify")))
        .header("x-actor-id", UserId::new().to_string())
        .json(&json!({ "verification_status": "verified", "reviewer_id": reviewer.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["field"], "reviewer_id");

    let res = client
        .post(server.url(&format!("/grns/{grn_id}/verify")))
        .header("x-actor-id", reviewer.to_string())
        .json(&json!({ "verification_status": "verified" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["grn"]["reviewed_by"], reviewer.to_string());
}

#[tokio::test]
async fn malformed_input_is_a_validation_error() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7005").await;
    let grn_id = open_first_grn(&client, &server, po).await;
    let counts = server.url(&format!("/grns/{grn_id}/counts"));

    let res = client
        .post(&counts)
        .json(&json!({
            "items": [{ "material_name": "Denim", "invoiced_quantity": "lots", "received_quantity": 85 }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(&counts)
        .json(&json!({
            "items": [{ "material_name": "Denim", "invoiced_quantity": 100, "received_quantity": -3 }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["field"], "items[0].received_quantity");

    let res = client
        .post(server.url("/grns/not-a-uuid/counts"))
        .json(&json!({ "items": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(&counts)
        .header("x-actor-id", "store-keeper")
        .json(&json!({ "items": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_actor");
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url(&format!("/purchase-orders/{}/receipts", PurchaseOrderId::new())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .delete(server.url(&format!("/grns/{}", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_then_delete_grn() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let po = server.approved_order("PO-7006").await;
    let grn_id = open_first_grn(&client, &server, po).await;

    let res = client
        .post(server.url(&format!("/grns/{grn_id}/cancel")))
        .json(&json!({ "reason": "wrong vendor on the truck" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let grn: Value = res.json().await.unwrap();
    assert_eq!(grn["status"], "cancelled");

    let res = client
        .delete(server.url(&format!("/grns/{grn_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(server.url(&format!("/grns/{grn_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(server.url(&format!("/purchase-orders/{po}/cancel")))
        .json(&json!({ "reason": "vendor withdrew" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");
}
