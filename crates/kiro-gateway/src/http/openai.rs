//! OpenAI-compatible `/v1/chat/completions` endpoint. Lets any client that
//! speaks the OpenAI API use the gateway unchanged.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use std::net::SocketAddr;
use std::sync::Arc;

use kiro_core::trace::{MsgId, TraceContext};
use kiro_core::GatewayError;
use kiro_wire::openai::{translate, OpenAiChatRequest};

use crate::app::AppState;
use crate::http::error_response;
use crate::logfmt;
use crate::pipeline::{run_chat, Dialect};

/// POST /v1/chat/completions — streaming or batched.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(msg_id): Extension<MsgId>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = TraceContext::new(msg_id, addr.to_string(), &body);

    let request: OpenAiChatRequest = match serde_json::from_slice(&body) {
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

    run_chat(state, ctx, headers, exchange, Dialect::OpenAi).await
}
