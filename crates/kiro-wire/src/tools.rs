//! Tool name sanitisation and input salvage.
//!
//! The upstream accepts tool names of letters, digits, `_`, and `-` only,
//! capped at 64 characters. Client names are rewritten to that class and
//! the forward mapping is retained so responses can restore the original
//! names.

use std::collections::HashMap;

use serde_json::Value;

use crate::chat::{ToolSpec, ToolUse};

pub const MAX_TOOL_NAME_LEN: usize = 64;
pub const MAX_TOOL_DESCRIPTION_LEN: usize = 10_240;

/// Sentinel placed into a missing required string field so the model tells
/// the client to retry with a real value.
pub const MISSING_FIELD_SENTINEL: &str =
    "[missing required parameter - ask the user and retry the tool call]";

/// Bidirectional record of sanitisation: sanitized → original.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    forward: HashMap<String, String>,
}

impl ToolNameMap {
    /// Register a client tool name, returning its sanitized form.
    pub fn register(&mut self, original: &str) -> String {
        let sanitized = sanitize_name(original);
        self.forward.insert(sanitized.clone(), original.to_string());
        sanitized
    }

    /// Restore the client's original name for a sanitized one. Names that
    /// were never registered pass through unchanged.
    pub fn original(&self, sanitized: &str) -> String {
        self.forward
            .get(sanitized)
            .cloned()
            .unwrap_or_else(|| sanitized.to_string())
    }
}

/// Rewrite a tool name to `[A-Za-z0-9_-]`, capping the length.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_TOOL_NAME_LEN);
    out
}

/// Cap a tool description, marking the cut with an ellipsis.
pub fn cap_description(description: &str) -> String {
    if description.chars().count() <= MAX_TOOL_DESCRIPTION_LEN {
        return description.to_string();
    }
    let mut out: String = description.chars().take(MAX_TOOL_DESCRIPTION_LEN).collect();
    out.push_str("...");
    out
}

/// Build the upstream-facing tool list, sanitising names and capping
/// descriptions. The map records how to restore names on the way back.
pub fn prepare_tools(tools: Vec<ToolSpec>, name_map: &mut ToolNameMap) -> Vec<ToolSpec> {
    tools
        .into_iter()
        .map(|tool| ToolSpec {
            name: name_map.register(&tool.name),
            description: cap_description(&tool.description),
            input_schema: tool.input_schema,
        })
        .collect()
}

/// Fill in declared-required fields missing from a tool-use input so the
/// upstream never rejects the history outright. Sentinels depend on the
/// declared type: strings get a retry instruction, numbers 0, booleans
/// false, arrays/objects their empty form.
pub fn salvage_required_fields(tool_use: &mut ToolUse, schema: &Value) {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return;
    };
    let properties = schema.get("properties");

    if !tool_use.input.is_object() {
        tool_use.input = Value::Object(Default::default());
    }
    let Some(input) = tool_use.input.as_object_mut() else {
        return;
    };

    for field in required.iter().filter_map(Value::as_str) {
        if input.contains_key(field) {
            continue;
        }
        let declared_type = properties
            .and_then(|p| p.get(field))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("string");

        let sentinel = match declared_type {
            "integer" | "number" => Value::from(0),
            "boolean" => Value::from(false),
            "array" => Value::Array(Vec::new()),
            "object" => Value::Object(Default::default()),
            _ => Value::from(MISSING_FIELD_SENTINEL),
        };
        input.insert(field.to_string(), sentinel);
    }
}
