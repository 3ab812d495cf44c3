//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, relay and notification-sink wiring from settings
//! - `routes/`: HTTP routes + handlers (one file per resource)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use loomerp_infra::{ReceivingEngine, ReceivingStore};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around an engine.
pub fn build_app<S: ReceivingStore>(engine: Arc<ReceivingEngine<S>>) -> Router {
    let receiving = routes::router::<S>()
        .layer(Extension(engine))
        .layer(axum::middleware::from_fn(middleware::actor_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(receiving)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
