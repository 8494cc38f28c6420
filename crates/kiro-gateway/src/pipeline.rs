//! The per-request orchestration pipeline.
//!
//! Wires model normalisation, notice decision, account selection, upstream
//! dispatch, streaming translation, and terminal reporting together. At
//! most two accounts are tried per request; failures classified as
//! circuit-breaking are recorded against the tried account and may trip
//! its breaker.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use kiro_auth::store::UpstreamCredentials;
use kiro_core::trace::TraceContext;
use kiro_core::{GatewayError, Result};
use kiro_wire::collect::ResponseCollector;
use kiro_wire::emit_anthropic::{batch_response as anthropic_batch, AnthropicEmitter};
use kiro_wire::emit_openai::{batch_response as openai_batch, OpenAiEmitter};
use kiro_wire::eventstream::{parse_event, FrameDecoder, UsageUpdate};
use kiro_wire::notice::{history_contains_tag, render_notice, strip_notice_blocks};
use kiro_wire::{ChatExchange, UpstreamEvent};

use crate::app::AppState;
use crate::http::error_response;
use crate::logfmt;
use crate::usage::UsageSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// Maximum accounts tried within a single request.
const MAX_ATTEMPTS: usize = 2;

pub async fn run_chat(
    state: Arc<AppState>,
    mut ctx: TraceContext,
    headers: HeaderMap,
    mut exchange: ChatExchange,
    dialect: Dialect,
) -> Response {
    ctx.debug = exchange.debug_marker;
    logfmt::package_inbound(&ctx);

    // model normalisation and validation
    match state.model_map.resolve(&exchange.model) {
        Ok(model) => exchange.model = model,
        Err(e) => {
            logfmt::request_error(&ctx, &headers, &e);
            return error_response(Some(&ctx.msg_id), &e);
        }
    }

    // conversation-level notice decision; prior notices are stripped from
    // assistant history before dispatch
    let notice_config = state.notice_snapshot();
    if notice_config.enabled && !notice_config.message.is_empty() {
        let seen = history_contains_tag(&exchange.messages, &notice_config.identity_tag);
        ctx.inject_notice = !seen;
        strip_notice_blocks(&mut exchange.messages, &notice_config.identity_tag);
    }

    let estimated_input = estimate_input_tokens(&exchange);

    // account selection and upstream dispatch, retrying once on a fresh
    // eligible account
    let (upstream_resp, creds) = match dispatch_with_retry(&state, &mut ctx, &exchange).await {
        Ok(pair) => pair,
        Err(e) => {
            logfmt::request_error(&ctx, &headers, &e);
            let resp = error_response(Some(&ctx.msg_id), &e);
            logfmt::package_return(&ctx, resp.status().as_u16(), &e.to_string());
            return resp;
        }
    };

    let notice_text = if ctx.inject_notice {
        Some(render_notice(&notice_config))
    } else {
        None
    };

    if exchange.stream {
        stream_response(
            state,
            ctx,
            exchange,
            dialect,
            upstream_resp,
            creds,
            notice_text,
            estimated_input,
        )
    } else {
        batch(
            state,
            ctx,
            headers,
            exchange,
            dialect,
            upstream_resp,
            creds,
            notice_text,
        )
        .await
    }
}

async fn dispatch_with_retry(
    state: &Arc<AppState>,
    ctx: &mut TraceContext,
    exchange: &ChatExchange,
) -> Result<(reqwest::Response, UpstreamCredentials)> {
    let mut exclude = HashSet::new();
    let mut last_err: Option<GatewayError> = None;

    for _ in 0..MAX_ATTEMPTS {
        let selected = match state.selector.select(&exclude).await {
            Ok(s) => s,
            Err(e) => return Err(last_err.unwrap_or(e)),
        };
        ctx.account_id = Some(selected.account_id.clone());

        let creds = match state.accounts.credentials_for(&selected.account_id).await {
            Ok(creds) => creds,
            Err(e) => {
                record_attempt_failure(state, &selected.account_id, &e);
                exclude.insert(selected.account_id);
                last_err = Some(e);
                continue;
            }
        };

        let body = crate::upstream::build_request_body(exchange, &creds);
        logfmt::package_upstream_request(ctx, &body);
        match state.upstream.send_chat(&creds, &body).await {
            Ok(resp) => return Ok((resp, creds)),
            Err(e) => {
                record_attempt_failure(state, &selected.account_id, &e);
                exclude.insert(selected.account_id);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(GatewayError::NoAccountsAvailable))
}

fn record_attempt_failure(state: &Arc<AppState>, account_id: &str, err: &GatewayError) {
    if err.counts_against_account() {
        state.breaker.on_failure(account_id);
        state.breaker.try_auto_trip(account_id);
    }
}

enum Emitter {
    Anthropic(AnthropicEmitter),
    OpenAi(OpenAiEmitter),
}

impl Emitter {
    fn push(&mut self, event: &UpstreamEvent) -> String {
        match self {
            Emitter::Anthropic(e) => e.push(event),
            Emitter::OpenAi(e) => e.push(event),
        }
    }

    fn usage(&self) -> UsageUpdate {
        match self {
            Emitter::Anthropic(e) => e.usage(),
            Emitter::OpenAi(e) => e.usage(),
        }
    }

    fn finish(self) -> String {
        match self {
            Emitter::Anthropic(e) => e.finish(),
            Emitter::OpenAi(e) => e.finish(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: Arc<AppState>,
    ctx: TraceContext,
    exchange: ChatExchange,
    dialect: Dialect,
    upstream_resp: reqwest::Response,
    creds: UpstreamCredentials,
    notice_text: Option<String>,
    estimated_input: u64,
) -> Response {
    let mut emitter = match dialect {
        Dialect::Anthropic => Emitter::Anthropic(AnthropicEmitter::new(
            ctx.msg_id.as_str(),
            &exchange.model,
            state.thinking_mode,
            exchange.name_map.clone(),
            notice_text,
            estimated_input,
        )),
        Dialect::OpenAi => Emitter::OpenAi(OpenAiEmitter::new(
            format!("chatcmpl-{}", Uuid::new_v4().simple()),
            &exchange.model,
            chrono::Utc::now().timestamp(),
            state.thinking_mode,
            exchange.name_map.clone(),
            notice_text,
            estimated_input,
        )),
    };
    let model = exchange.model.clone();
    let account_id = creds.account_id.clone();

    let stream = async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        let mut bytes_stream = upstream_resp.bytes_stream();
        // a mid-stream failure suppresses the normal closing events and is
        // recorded against the account
        let mut failed: Option<String> = None;

        'read: while let Some(chunk) = bytes_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    decoder.extend(&bytes);
                    while let Some(frame) = decoder.next_frame() {
                        let Some(event) = parse_event(&frame) else { continue };
                        logfmt::package_upstream_event(&ctx, &event);
                        if let UpstreamEvent::UpstreamError { kind, message } = &event {
                            // exception frame mid-stream: surface the SSE
                            // error frame and close, same as a transport
                            // failure
                            failed = Some(format!("{kind}: {message}"));
                            let sse = emitter.push(&event);
                            if !sse.is_empty() {
                                yield Ok::<Bytes, Infallible>(Bytes::from(sse));
                            }
                            break 'read;
                        }
                        let sse = emitter.push(&event);
                        if !sse.is_empty() {
                            yield Ok::<Bytes, Infallible>(Bytes::from(sse));
                        }
                    }
                }
                Err(e) => {
                    // transport failure after the status line: emit an SSE
                    // error frame and close; the status cannot be revised
                    warn!(msg_id = %ctx.msg_id, error = %e, "upstream stream failed");
                    failed = Some(e.to_string());
                    let frame = format!("data: {}\n\n", json!({"error": e.to_string()}));
                    yield Ok(Bytes::from(frame));
                    break;
                }
            }
        }

        let usage = emitter.usage();
        match failed {
            None => {
                let tail = emitter.finish();
                if !tail.is_empty() {
                    yield Ok(Bytes::from(tail));
                }
                state.breaker.on_success(&account_id);
                state.usage.record(UsageSample {
                    account_id: account_id.clone(),
                    model,
                    input_tokens: usage.input_tokens.max(estimated_input),
                    output_tokens: usage.output_tokens,
                    cache_read_tokens: usage.cache_read_tokens,
                    cache_write_tokens: usage.cache_write_tokens,
                });
                logfmt::package_return(&ctx, 200, "[stream complete]");
            }
            Some(reason) => {
                state.breaker.on_failure(&account_id);
                state.breaker.try_auto_trip(&account_id);
                logfmt::package_return(&ctx, 200, &reason);
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[allow(clippy::too_many_arguments)]
async fn batch(
    state: Arc<AppState>,
    ctx: TraceContext,
    headers: HeaderMap,
    exchange: ChatExchange,
    dialect: Dialect,
    upstream_resp: reqwest::Response,
    creds: UpstreamCredentials,
    notice_text: Option<String>,
) -> Response {
    let mut decoder = FrameDecoder::new();
    let mut collector = ResponseCollector::new();
    let mut bytes_stream = upstream_resp.bytes_stream();
    let mut transport_error: Option<String> = None;

    while let Some(chunk) = bytes_stream.next().await {
        match chunk {
            Ok(bytes) => {
                decoder.extend(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    if let Some(event) = parse_event(&frame) {
                        logfmt::package_upstream_event(&ctx, &event);
                        collector.push(&event);
                    }
                }
            }
            Err(e) => {
                transport_error = Some(e.to_string());
                break;
            }
        }
    }

    let collected = collector.finish();
    let failure = transport_error.or_else(|| {
        collected
            .upstream_error
            .as_ref()
            .map(|(kind, message)| format!("{kind}: {message}"))
    });

    if let Some(reason) = failure {
        state.breaker.on_failure(&creds.account_id);
        state.breaker.try_auto_trip(&creds.account_id);
        let err = GatewayError::Upstream {
            status: 502,
            message: reason,
        };
        logfmt::request_error(&ctx, &headers, &err);
        let resp = error_response(Some(&ctx.msg_id), &err);
        logfmt::package_return(&ctx, resp.status().as_u16(), &err.to_string());
        return resp;
    }

    state.breaker.on_success(&creds.account_id);
    state.usage.record(UsageSample {
        account_id: creds.account_id.clone(),
        model: exchange.model.clone(),
        input_tokens: collected.usage.input_tokens,
        output_tokens: collected.usage.output_tokens,
        cache_read_tokens: collected.usage.cache_read_tokens,
        cache_write_tokens: collected.usage.cache_write_tokens,
    });

    let body = match dialect {
        Dialect::Anthropic => anthropic_batch(
            ctx.msg_id.as_str(),
            &exchange.model,
            &collected,
            &exchange.name_map,
            state.thinking_mode,
            notice_text.as_deref(),
        ),
        Dialect::OpenAi => openai_batch(
            &format!("chatcmpl-{}", Uuid::new_v4().simple()),
            &exchange.model,
            chrono::Utc::now().timestamp(),
            &collected,
            &exchange.name_map,
            state.thinking_mode,
            notice_text.as_deref(),
        ),
    };

    let rendered = body.to_string();
    logfmt::package_return(&ctx, 200, &rendered);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(rendered))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Rough prompt-size estimate: one token per four characters, at least one.
pub fn estimate_input_tokens(exchange: &ChatExchange) -> u64 {
    let chars: usize = exchange
        .messages
        .iter()
        .map(|m| {
            m.content.chars().count()
                + m.tool_results
                    .iter()
                    .map(|r| r.content.chars().count())
                    .sum::<usize>()
        })
        .sum();
    ((chars as u64)
        .saturating_add(3)
        / 4)
    .max(1)
}
