use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use loomerp_core::UserId;

use crate::app::errors;
use crate::context::ActorContext;

pub const ACTOR_HEADER: &str = "x-actor-id";

pub async fn actor_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let actor_id = match extract_actor(req.headers()) {
        Ok(actor_id) => actor_id,
        Err(message) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_actor", message);
        }
    };

    req.extensions_mut().insert(ActorContext::new(actor_id));
    next.run(req).await
}

fn extract_actor(headers: &HeaderMap) -> Result<Option<UserId>, String> {
    let Some(header) = headers.get(ACTOR_HEADER) else {
        return Ok(None);
    };

    let value = header
        .to_str()
        .map_err(|_| format!("{ACTOR_HEADER} must be ASCII"))?
        .trim();
    if value.is_empty() {
        return Ok(None);
    }

    value
        .parse::<UserId>()
        .map(Some)
        .map_err(|_| format!("{ACTOR_HEADER} must be a UUID"))
}
