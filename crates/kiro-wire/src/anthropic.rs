//! Anthropic Messages request parsing into the canonical form.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use kiro_core::{GatewayError, Result};

use crate::chat::{
    contains_debug_marker, inject_system_prompt, validate_tool_result_references, ChatExchange,
    ChatMessage, ImageBlock, ToolResult, ToolResultStatus, ToolSpec, ToolUse,
};
use crate::tools::{prepare_tools, salvage_required_fields, sanitize_name, ToolNameMap};

#[derive(Debug, Deserialize)]
pub struct AnthropicChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<AnthropicSystem>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicSystemBlock {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type", default)]
    pub source_type: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Translate an Anthropic Messages payload into the canonical exchange.
pub fn translate(req: AnthropicChatRequest) -> Result<ChatExchange> {
    let mut name_map = ToolNameMap::default();
    let tools = prepare_tools(
        req.tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect(),
        &mut name_map,
    );
    let schemas: HashMap<String, Value> = tools
        .iter()
        .map(|t| (t.name.clone(), t.input_schema.clone()))
        .collect();

    let mut messages: Vec<ChatMessage> = Vec::new();
    for message in req.messages {
        let mut out = match message.role.as_str() {
            "user" => ChatMessage::user(""),
            "assistant" => ChatMessage::assistant(""),
            other => {
                debug!(role = other, "ignoring message with unknown role");
                continue;
            }
        };

        match message.content {
            AnthropicContent::Text(text) => out.content = text,
            AnthropicContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        AnthropicBlock::Text { text } => out.content.push_str(&text),
                        AnthropicBlock::Image { source } => {
                            if source.source_type == "base64" && !source.data.is_empty() {
                                let format =
                                    source.media_type.strip_prefix("image/").unwrap_or("png");
                                out.images.push(ImageBlock::new(format, source.data));
                            }
                        }
                        AnthropicBlock::ToolUse { id, name, input } => {
                            let mut tool_use = ToolUse {
                                id,
                                name: sanitize_name(&name),
                                input,
                            };
                            if let Some(schema) = schemas.get(&tool_use.name) {
                                salvage_required_fields(&mut tool_use, schema);
                            }
                            out.tool_uses.push(tool_use);
                        }
                        AnthropicBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            out.tool_results.push(ToolResult {
                                tool_use_id,
                                content: tool_result_text(content),
                                status: if is_error {
                                    ToolResultStatus::Error
                                } else {
                                    ToolResultStatus::Success
                                },
                            });
                        }
                        AnthropicBlock::Unknown => {}
                    }
                }
            }
        }

        if !out.is_empty() {
            messages.push(out);
        }
    }

    let system = req.system.map(|s| match s {
        AnthropicSystem::Text(text) => text,
        AnthropicSystem::Blocks(blocks) => blocks
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n\n"),
    });
    inject_system_prompt(&mut messages, system);

    validate_tool_result_references(&messages).map_err(GatewayError::InvalidRequest)?;

    let debug_marker = contains_debug_marker(&messages);
    Ok(ChatExchange {
        model: req.model,
        messages,
        tools,
        stream: req.stream,
        max_tokens: req.max_tokens,
        name_map,
        debug_marker,
    })
}

fn tool_result_text(content: Option<ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text,
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .into_iter()
            .filter_map(|b| match b {
                AnthropicBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use serde_json::json;

    fn parse(raw: Value) -> ChatExchange {
        let req: AnthropicChatRequest = serde_json::from_value(raw).unwrap();
        translate(req).unwrap()
    }

    #[test]
    fn simple_messages_request() {
        let exchange = parse(json!({
            "model": "claude-sonnet-4.5",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(exchange.max_tokens, Some(16));
        assert!(exchange.stream);
        assert_eq!(exchange.messages[0].content, "hi");
    }

    #[test]
    fn system_string_and_block_forms() {
        let from_string = parse(json!({
            "model": "m",
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let from_blocks = parse(json!({
            "model": "m",
            "system": [{"type": "text", "text": "Be terse."}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(from_string.messages[0].content, "Be terse.");
        assert_eq!(from_blocks.messages[0].content, "Be terse.");
        assert_eq!(from_string.messages[1].role, Role::Assistant);
    }

    #[test]
    fn base64_image_block() {
        let exchange = parse(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/jpg", "data": "QUJD"
                    }}
                ]
            }]
        }));
        let message = &exchange.messages[0];
        assert_eq!(message.images[0].format, "jpeg");
        assert_eq!(message.images[0].data, "QUJD");
    }

    #[test]
    fn tool_use_and_result_blocks() {
        let exchange = parse(json!({
            "model": "m",
            "tools": [{
                "name": "get weather",
                "description": "forecast",
                "input_schema": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }
            }],
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Checking."},
                    {"type": "tool_use", "id": "tu_1", "name": "get weather",
                     "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "rain"}
                ]}
            ]
        }));

        assert_eq!(exchange.tools[0].name, "get_weather");
        let assistant = &exchange.messages[1];
        assert_eq!(assistant.content, "Checking.");
        assert_eq!(assistant.tool_uses[0].input["city"], "Oslo");
        let user = &exchange.messages[2];
        assert_eq!(user.tool_results[0].content, "rain");
        assert_eq!(user.tool_results[0].status, ToolResultStatus::Success);
    }

    #[test]
    fn error_tool_result_keeps_status() {
        let exchange = parse(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "run", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1",
                     "content": "exit 1", "is_error": true}
                ]}
            ]
        }));
        assert_eq!(
            exchange.messages[1].tool_results[0].status,
            ToolResultStatus::Error
        );
    }

    #[test]
    fn tool_result_block_content_form() {
        let exchange = parse(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "run", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1",
                     "content": [{"type": "text", "text": "part one "},
                                  {"type": "text", "text": "part two"}]}
                ]}
            ]
        }));
        assert_eq!(
            exchange.messages[1].tool_results[0].content,
            "part one part two"
        );
    }

    #[test]
    fn unknown_blocks_are_ignored() {
        let exchange = parse(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "hello"},
                    {"type": "document", "source": {"data": "xxx"}}
                ]
            }]
        }));
        assert_eq!(exchange.messages[0].content, "hello");
        assert!(exchange.messages[0].images.is_empty());
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let req: AnthropicChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "ghost", "content": "boo"}
                ]}
            ]
        }))
        .unwrap();
        assert!(matches!(
            translate(req).unwrap_err(),
            GatewayError::InvalidRequest(_)
        ));
    }

    #[test]
    fn empty_messages_with_system_get_continue() {
        let exchange = parse(json!({
            "model": "m",
            "system": "Be terse.",
            "messages": []
        }));
        assert_eq!(exchange.messages.len(), 3);
        assert_eq!(exchange.messages[2].content, "Continue");
    }
}
