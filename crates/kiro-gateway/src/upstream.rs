//! Vendor chat dispatch.
//!
//! Builds the upstream JSON payload from the canonical exchange and posts
//! it to the region endpoint with the selected account's credential. The
//! response body is an AWS EventStream; this module hands the raw byte
//! stream back to the pipeline.

use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use kiro_auth::store::UpstreamCredentials;
use kiro_core::config::{chat_endpoint, UpstreamConfig};
use kiro_core::{GatewayError, Result};
use kiro_wire::chat::{ChatExchange, ChatMessage, Role};

pub struct UpstreamClient {
    http: reqwest::Client,
    endpoint_override: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        Self {
            http: builder.build().unwrap_or_default(),
            endpoint_override: config.endpoint_override.clone(),
        }
    }

    /// Dispatch a prepared chat payload; returns the streaming response on
    /// 2xx and a classified upstream error otherwise.
    pub async fn send_chat(
        &self,
        creds: &UpstreamCredentials,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let url = self
            .endpoint_override
            .clone()
            .unwrap_or_else(|| chat_endpoint(&creds.region));

        debug!(account_id = %creds.account_id, "dispatching upstream chat");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&creds.access_token)
            .header("content-type", "application/json")
            .header("accept", "application/vnd.amazon.eventstream")
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream {
                status: 0,
                message: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "upstream chat error");
            return Err(GatewayError::Upstream {
                status,
                message: text,
            });
        }
        Ok(resp)
    }
}

/// The vendor payload: internal messages, tools, tool-results, profile ARN,
/// and model, under a fresh conversation id.
pub fn build_request_body(exchange: &ChatExchange, creds: &UpstreamCredentials) -> Value {
    let messages: Vec<Value> = exchange.messages.iter().map(encode_message).collect();

    let mut body = json!({
        "conversationId": Uuid::new_v4().to_string(),
        "profileArn": creds.profile_arn,
        "model": exchange.model,
        "messages": messages,
    });

    if !exchange.tools.is_empty() {
        let tools: Vec<Value> = exchange
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    if let Some(max_tokens) = exchange.max_tokens {
        body["maxTokens"] = Value::from(max_tokens);
    }
    body
}

fn encode_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let mut out = json!({
        "role": role,
        "content": message.content,
    });

    if !message.images.is_empty() {
        let images: Vec<Value> = message
            .images
            .iter()
            .map(|image| {
                json!({
                    "format": image.format,
                    "source": {"bytes": image.data},
                })
            })
            .collect();
        out["images"] = Value::Array(images);
    }
    if !message.tool_uses.is_empty() {
        let uses: Vec<Value> = message
            .tool_uses
            .iter()
            .map(|tool_use| {
                json!({
                    "toolUseId": tool_use.id,
                    "name": tool_use.name,
                    "input": tool_use.input,
                })
            })
            .collect();
        out["toolUses"] = Value::Array(uses);
    }
    if !message.tool_results.is_empty() {
        let results: Vec<Value> = message
            .tool_results
            .iter()
            .map(|result| {
                json!({
                    "toolUseId": result.tool_use_id,
                    "content": result.content,
                    "status": result.status,
                })
            })
            .collect();
        out["toolResults"] = Value::Array(results);
    }
    out
}
