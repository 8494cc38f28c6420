//! Canonical internal chat representation.
//!
//! Both client dialects translate into these types before upstream
//! dispatch, and the response path translates back out of them.

use serde::{Deserialize, Serialize};

use crate::tools::ToolNameMap;

/// The literal that flips a request into full debug logging.
pub const DEBUG_MARKER: &str = "OneDayAI_Start_Debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// An inline image carried in a user message. `data` is the raw base64
/// payload; `format` is normalised (`jpg` → `jpeg`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub format: String,
    pub data: String,
}

impl ImageBlock {
    pub fn new(format: &str, data: impl Into<String>) -> Self {
        let format = match format {
            "jpg" => "jpeg",
            other => other,
        };
        Self {
            format: format.to_string(),
            data: data.into(),
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation declared by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

/// The client-supplied outcome of a prior tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub status: ToolResultStatus,
}

/// One turn of the conversation in canonical form. At least one of
/// content / images / tool_uses / tool_results is non-empty; tool_uses
/// appear only on assistant turns, tool_results only on user turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.images.is_empty()
            && self.tool_uses.is_empty()
            && self.tool_results.is_empty()
    }
}

/// Output of request-side translation: everything the orchestrator needs
/// to dispatch upstream and translate the response back.
#[derive(Debug, Clone)]
pub struct ChatExchange {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    /// sanitized → original tool names, for the response path.
    pub name_map: ToolNameMap,
    /// The request contained the debug marker literal.
    pub debug_marker: bool,
}

/// Render the client's system prompt as a leading user/assistant pair.
/// No visible delimiter is emitted — it would leak into the model's reply.
/// A client that sent no messages at all gets a trailing "Continue" turn so
/// the conversation always ends on a user message.
pub fn inject_system_prompt(messages: &mut Vec<ChatMessage>, system: Option<String>) {
    let had_messages = !messages.is_empty();

    if let Some(system) = system {
        if !system.is_empty() {
            messages.insert(0, ChatMessage::assistant("I will follow these instructions."));
            messages.insert(0, ChatMessage::user(system));
        }
    }

    if !had_messages {
        messages.push(ChatMessage::user("Continue"));
    }
}

/// True when any textual content of any message contains the debug marker.
pub fn contains_debug_marker(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| {
        m.content.contains(DEBUG_MARKER)
            || m.tool_results.iter().any(|r| r.content.contains(DEBUG_MARKER))
    })
}

/// Every tool-result must answer a tool-use from a prior assistant turn.
pub fn validate_tool_result_references(messages: &[ChatMessage]) -> Result<(), String> {
    let mut seen_ids = std::collections::HashSet::new();
    for message in messages {
        match message.role {
            Role::Assistant => {
                for tool_use in &message.tool_uses {
                    seen_ids.insert(tool_use.id.as_str());
                }
            }
            Role::User => {
                for result in &message.tool_results {
                    if !seen_ids.contains(result.tool_use_id.as_str()) {
                        return Err(format!(
                            "tool_result references unknown tool_use id {}",
                            result.tool_use_id
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_format_normalisation() {
        assert_eq!(ImageBlock::new("jpg", "x").format, "jpeg");
        assert_eq!(ImageBlock::new("jpeg", "x").format, "jpeg");
        assert_eq!(ImageBlock::new("png", "x").format, "png");
    }

    #[test]
    fn system_prompt_becomes_leading_pair() {
        let mut messages = vec![ChatMessage::user("hi")];
        inject_system_prompt(&mut messages, Some("Be terse.".into()));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Be terse.");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "I will follow these instructions.");
        assert_eq!(messages[2].content, "hi");
    }

    #[test]
    fn empty_history_gets_continue_turn() {
        let mut messages = Vec::new();
        inject_system_prompt(&mut messages, Some("Be terse.".into()));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "Continue");
    }

    #[test]
    fn no_system_no_pair() {
        let mut messages = vec![ChatMessage::user("hi")];
        inject_system_prompt(&mut messages, None);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn debug_marker_detection() {
        let messages = vec![ChatMessage::user(format!("please {DEBUG_MARKER} now"))];
        assert!(contains_debug_marker(&messages));
        assert!(!contains_debug_marker(&[ChatMessage::user("plain")]));
    }

    #[test]
    fn tool_result_must_follow_tool_use() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_uses.push(ToolUse {
            id: "tu_1".into(),
            name: "get_weather".into(),
            input: serde_json::json!({}),
        });
        let mut user = ChatMessage::user("");
        user.tool_results.push(ToolResult {
            tool_use_id: "tu_1".into(),
            content: "sunny".into(),
            status: ToolResultStatus::Success,
        });

        assert!(validate_tool_result_references(&[assistant.clone(), user.clone()]).is_ok());
        // a result with no prior declaration is rejected
        assert!(validate_tool_result_references(&[user]).is_err());
    }
}
