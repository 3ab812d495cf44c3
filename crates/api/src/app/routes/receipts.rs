//! Purchase-order scoped receiving endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use loomerp_core::PurchaseOrderId;
use loomerp_infra::{ReceivingEngine, ReceivingStore};

use crate::app::{dto, errors};
use crate::context::ActorContext;

pub fn router<S: ReceivingStore>() -> Router {
    Router::new()
        .route("/:id/receipts", post(open_receipt::<S>).get(chain_summary::<S>))
        .route("/:id/shortage-receipts", post(create_shortage_receipt::<S>))
        .route("/:id/fulfil", post(mark_fulfilled::<S>))
        .route("/:id/cancel", post(cancel_purchase_order::<S>))
}

pub async fn open_receipt<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::OpenReceiptRequest>>,
) -> axum::response::Response {
    let po_id: PurchaseOrderId = match errors::parse_id(&id, "purchase order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = body.unwrap_or_default();

    match engine.open_receipt(po_id, body.remarks, actor.actor_id()).await {
        Ok(grn) => (StatusCode::CREATED, Json(grn)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn chain_summary<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let po_id: PurchaseOrderId = match errors::parse_id(&id, "purchase order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match engine.chain_summary(po_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn create_shortage_receipt<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::ShortageReceiptRequest>, JsonRejection>,
) -> axum::response::Response {
    let po_id: PurchaseOrderId = match errors::parse_id(&id, "purchase order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match engine
        .create_shortage_fulfillment(po_id, body.into(), actor.actor_id())
        .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn mark_fulfilled<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let po_id: PurchaseOrderId = match errors::parse_id(&id, "purchase order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match engine.mark_fulfilled(po_id, actor.actor_id()).await {
        Ok(status) => Json(dto::StatusResponse { status }).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_purchase_order<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::ReasonRequest>, JsonRejection>,
) -> axum::response::Response {
    let po_id: PurchaseOrderId = match errors::parse_id(&id, "purchase order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match engine
        .cancel_purchase_order(po_id, body.reason, actor.actor_id())
        .await
    {
        Ok(status) => Json(dto::StatusResponse { status }).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
