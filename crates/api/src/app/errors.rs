use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use loomerp_infra::EngineError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "validation_error",
                "field": field,
                "message": message,
            })),
        )
            .into_response(),
        EngineError::NotFound { entity, id } => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{entity} {id} not found"),
        ),
        EngineError::Conflict {
            kind,
            message,
            current,
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "conflict",
                "kind": kind.as_str(),
                "message": message,
                "current": current,
            })),
        )
            .into_response(),
        EngineError::TransactionFailure(msg) => {
            tracing::error!(error = %msg, "receiving transaction failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "transaction_failure",
                "the operation was rolled back; retry later",
            )
        }
    }
}

/// Malformed or mistyped JSON bodies are validation errors, not 422s.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse an id path segment, answering 400 when it is not a UUID.
pub fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, axum::response::Response> {
    raw.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {what} id `{raw}`"),
        )
    })
}
