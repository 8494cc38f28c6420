//! OpenAI chat-completions request parsing into the canonical form.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use kiro_core::{GatewayError, Result};

use crate::chat::{
    contains_debug_marker, inject_system_prompt, validate_tool_result_references, ChatExchange,
    ChatMessage, ImageBlock, Role, ToolResult, ToolResultStatus, ToolSpec, ToolUse,
};
use crate::tools::{prepare_tools, salvage_required_fields, sanitize_name, ToolNameMap};

#[derive(Debug, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<OpenAiTool>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAiToolCall>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAiPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlPart },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrlPart {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiTool {
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Translate an OpenAI payload into the canonical exchange. The model name
/// is carried through verbatim; normalisation happens in the orchestrator.
pub fn translate(req: OpenAiChatRequest) -> Result<ChatExchange> {
    let mut name_map = ToolNameMap::default();
    let tools = prepare_tools(
        req.tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.function.name,
                description: t.function.description,
                input_schema: t.function.parameters,
            })
            .collect(),
        &mut name_map,
    );
    let schemas: HashMap<String, Value> = tools
        .iter()
        .map(|t| (t.name.clone(), t.input_schema.clone()))
        .collect();

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ChatMessage> = Vec::new();

    for message in req.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = text_of(message.content.as_ref()) {
                    system_parts.push(text);
                }
            }
            "user" => {
                let mut out = ChatMessage::user("");
                fill_user_content(&mut out, message.content);
                if !out.is_empty() {
                    messages.push(out);
                }
            }
            "assistant" => {
                let mut out = ChatMessage::assistant(text_of(message.content.as_ref()).unwrap_or_default());
                for call in message.tool_calls {
                    let name = sanitize_name(&call.function.name);
                    let input = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| Value::Object(Default::default()));
                    let mut tool_use = ToolUse {
                        id: call.id,
                        name,
                        input,
                    };
                    if let Some(schema) = schemas.get(&tool_use.name) {
                        salvage_required_fields(&mut tool_use, schema);
                    }
                    out.tool_uses.push(tool_use);
                }
                if !out.is_empty() {
                    messages.push(out);
                }
            }
            "tool" => {
                let result = ToolResult {
                    tool_use_id: message.tool_call_id.unwrap_or_default(),
                    content: text_of(message.content.as_ref()).unwrap_or_default(),
                    status: ToolResultStatus::Success,
                };
                // consecutive tool messages fold into one user turn
                match messages.last_mut() {
                    Some(last) if last.role == Role::User && !last.tool_results.is_empty() => {
                        last.tool_results.push(result);
                    }
                    _ => {
                        let mut out = ChatMessage::user("");
                        out.tool_results.push(result);
                        messages.push(out);
                    }
                }
            }
            other => {
                debug!(role = other, "ignoring message with unknown role");
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    inject_system_prompt(&mut messages, system);

    validate_tool_result_references(&messages).map_err(GatewayError::InvalidRequest)?;

    let debug_marker = contains_debug_marker(&messages);
    Ok(ChatExchange {
        model: req.model,
        messages,
        tools,
        stream: req.stream,
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        name_map,
        debug_marker,
    })
}

fn text_of(content: Option<&OpenAiContent>) -> Option<String> {
    match content {
        Some(OpenAiContent::Text(text)) => Some(text.clone()),
        Some(OpenAiContent::Parts(parts)) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| match p {
                    OpenAiPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            Some(joined)
        }
        None => None,
    }
}

fn fill_user_content(out: &mut ChatMessage, content: Option<OpenAiContent>) {
    match content {
        Some(OpenAiContent::Text(text)) => out.content = text,
        Some(OpenAiContent::Parts(parts)) => {
            let mut text = String::new();
            for part in parts {
                match part {
                    OpenAiPart::Text { text: t } => text.push_str(&t),
                    OpenAiPart::ImageUrl { image_url } => {
                        if let Some(image) = parse_data_url(&image_url.url) {
                            out.images.push(image);
                        }
                    }
                    OpenAiPart::Unknown => {}
                }
            }
            out.content = text;
        }
        None => {}
    }
}

/// `data:image/<format>;base64,<payload>` → an inline image block.
/// Anything else (http URLs, non-base64 encodings) is ignored.
fn parse_data_url(url: &str) -> Option<ImageBlock> {
    let rest = url.strip_prefix("data:image/")?;
    let (format, payload) = rest.split_once(";base64,")?;
    if format.is_empty() || payload.is_empty() {
        return None;
    }
    Some(ImageBlock::new(format, payload))
}
