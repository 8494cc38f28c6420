//! Request-correlated logging.
//!
//! Four "packages" per request when debug is active: inbound body,
//! upstream request body, upstream raw events, outbound body. In normal
//! mode only errors and non-2xx completions are emitted. Error records
//! carry a redacted header map and a truncated body.

use axum::http::HeaderMap;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use kiro_core::trace::{excerpt, TraceContext};

const REDACTED: &str = "[REDACTED]";

/// Header names whose values never reach the log sink.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "x-csrf-token",
    "x-access-token",
    "x-refresh-token",
];

/// Package 1: the inbound client body.
pub fn package_inbound(ctx: &TraceContext) {
    if ctx.debug {
        info!(msg_id = %ctx.msg_id, body = %ctx.body_excerpt, "【package 1】client-request");
    } else {
        debug!(msg_id = %ctx.msg_id, "【package 1】client-request");
    }
}

/// Package 2: the upstream request body.
pub fn package_upstream_request(ctx: &TraceContext, body: &serde_json::Value) {
    if ctx.debug {
        info!(msg_id = %ctx.msg_id, body = %excerpt(body.to_string().as_bytes()), "【package 2】upstream-request");
    } else {
        debug!(msg_id = %ctx.msg_id, "【package 2】upstream-request");
    }
}

/// Package 3: one decoded upstream event.
pub fn package_upstream_event(ctx: &TraceContext, event: &kiro_wire::UpstreamEvent) {
    if ctx.debug {
        info!(msg_id = %ctx.msg_id, event = ?event, "【package 3】upstream-event");
    } else {
        debug!(msg_id = %ctx.msg_id, event = ?event, "【package 3】upstream-event");
    }
}

/// Package 4: what went back to the client. Logged on every terminal
/// outcome; full body only when debug is active or the request failed.
pub fn package_return(ctx: &TraceContext, status: u16, body: &str) {
    let body = excerpt(body.as_bytes());
    if status >= 400 {
        error!(msg_id = %ctx.msg_id, status, body = %body, "【package 4】return-to-client");
    } else if ctx.debug {
        info!(msg_id = %ctx.msg_id, status, body = %body, "【package 4】return-to-client");
    } else {
        debug!(msg_id = %ctx.msg_id, status, "【package 4】return-to-client");
    }
}

/// Error record with sanitised headers and the truncated inbound body.
pub fn request_error(ctx: &TraceContext, headers: &HeaderMap, err: &kiro_core::GatewayError) {
    error!(
        msg_id = %ctx.msg_id,
        client = %ctx.client_addr,
        account_id = ctx.account_id.as_deref().unwrap_or("-"),
        code = err.code(),
        error = %err,
        headers = ?redact_headers(headers),
        body = %ctx.body_excerpt,
        "request failed"
    );
}

/// Copy headers with credential-bearing values replaced.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        let rendered = if SENSITIVE_HEADERS.contains(&key.as_str())
            || key.contains("token")
            || key.contains("csrf")
        {
            REDACTED.to_string()
        } else {
            value.to_str().unwrap_or(REDACTED).to_string()
        };
        out.insert(key, rendered);
    }
    out
}
