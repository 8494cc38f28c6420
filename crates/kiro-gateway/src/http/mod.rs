pub mod anthropic;
pub mod misc;
pub mod openai;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use kiro_core::trace::MsgId;
use kiro_core::GatewayError;

/// Uniform client-facing error body: `{"error": {...}, "msgId": "..."}`.
pub fn error_response(msg_id: Option<&MsgId>, err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        },
        "msgId": msg_id.map(MsgId::as_str).unwrap_or("-"),
    });
    (status, Json(body)).into_response()
}
