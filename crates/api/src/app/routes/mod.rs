use axum::Router;

use loomerp_infra::ReceivingStore;

pub mod grns;
pub mod receipts;
pub mod system;

/// Router for all receiving endpoints.
pub fn router<S: ReceivingStore>() -> Router {
    Router::new()
        .nest("/purchase-orders", receipts::router::<S>())
        .nest("/grns", grns::router::<S>())
}
