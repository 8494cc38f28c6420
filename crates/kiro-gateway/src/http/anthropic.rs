//! Anthropic Messages endpoints: `/v1/messages`, `/anthropic/v1/messages`,
//! and `/v1/messages/count_tokens`.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use kiro_core::trace::{MsgId, TraceContext};
use kiro_core::GatewayError;
use kiro_wire::anthropic::{translate, AnthropicChatRequest};

use crate::app::AppState;
use crate::http::error_response;
use crate::pipeline::{run_chat, Dialect};
use crate::logfmt;

/// POST /v1/messages — Anthropic Messages, streaming or batched.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Extension(msg_id): Extension<MsgId>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = TraceContext::new(msg_id, addr.to_string(), &body);

    let request: AnthropicChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = GatewayError::InvalidRequest(e.to_string());
            logfmt::request_error(&ctx, &headers, &err);
            return error_response(Some(&ctx.msg_id), &err);
        }
    };

    let exchange = match translate(request) {
        Ok(exchange) => exchange,
        Err(e) => {
            logfmt::request_error(&ctx, &headers, &e);
            return error_response(Some(&ctx.msg_id), &e);
        }
    };

    run_chat(state, ctx, headers, exchange, Dialect::Anthropic).await
}

/// POST /v1/messages/count_tokens — `{input_tokens}` estimated as
/// ceil(total_chars / 4), at least 1.
pub async fn count_tokens(
    Extension(msg_id): Extension<MsgId>,
    body: Bytes,
) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return error_response(
                Some(&msg_id),
                &GatewayError::InvalidRequest(e.to_string()),
            )
        }
    };

    let mut chars = 0usize;
    chars += string_chars(&parsed["messages"]);
    chars += string_chars(&parsed["system"]);
    let input_tokens = ((chars + 3) / 4).max(1);

    Json(json!({"input_tokens": input_tokens})).into_response()
}

/// Sum of characters across every string nested in `value`.
fn string_chars(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(string_chars).sum(),
        Value::Object(map) => map.values().map(string_chars).sum(),
        _ => 0,
    }
}
