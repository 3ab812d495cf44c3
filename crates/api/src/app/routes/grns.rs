//! Endpoints acting on a single goods receipt note.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use loomerp_core::GrnId;
use loomerp_infra::{ReceivingEngine, ReceivingStore};

use crate::app::{dto, errors};
use crate::context::ActorContext;

pub fn router<S: ReceivingStore>() -> Router {
    Router::new()
        .route("/:id", get(get_grn::<S>).delete(delete_grn::<S>))
        .route("/:id/counts", post(record_counts::<S>))
        .route("/:id/verify", post(verify_grn::<S>))
        .route("/:id/materialize", post(materialize::<S>))
        .route("/:id/cancel", post(cancel_grn::<S>))
}

pub async fn get_grn<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match engine.grn(grn_id).await {
        Ok(grn) => Json(grn).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn record_counts<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::RecordCountsRequest>, JsonRejection>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match engine
        .record_counts(grn_id, body.into_counts(), actor.actor_id())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn verify_grn<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::VerifyGrnRequest>, JsonRejection>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    let reviewer = match body.reviewer(actor.actor_id()) {
        Ok(reviewer) => reviewer,
        Err(e) => return errors::engine_error_to_response(e),
    };

    match engine
        .verify_grn(grn_id, body.verification_status, reviewer)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn materialize<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match engine.materialize(grn_id, actor.actor_id()).await {
        Ok(outcome) => {
            let status = if outcome.is_replay() {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(dto::MaterializeResponse::from(outcome))).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_grn<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::ReasonRequest>, JsonRejection>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match engine.cancel_grn(grn_id, body.reason, actor.actor_id()).await {
        Ok(grn) => Json(grn).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn delete_grn<S: ReceivingStore>(
    Extension(engine): Extension<Arc<ReceivingEngine<S>>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let grn_id: GrnId = match errors::parse_id(&id, "GRN") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match engine.delete_grn(grn_id, actor.actor_id()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
