//! OpenAI-dialect SSE emission.
//!
//! Every delta is wrapped in a `chat.completion.chunk`; the final chunk
//! carries `finish_reason` and the usage breakdown; the stream terminates
//! with the literal `data: [DONE]`.

use serde_json::{json, Value};

use crate::collect::{merge_usage, stop_reason, StopReason, ToolUseAssembler};
use crate::eventstream::{UpstreamEvent, UsageUpdate};
use crate::thinking::{Channel, TagScanner, ThinkingMode};
use crate::tools::ToolNameMap;

pub struct OpenAiEmitter {
    id: String,
    model: String,
    created: i64,
    mode: ThinkingMode,
    scanner: TagScanner,
    assembler: ToolUseAssembler,
    name_map: ToolNameMap,
    notice: Option<String>,
    estimated_input_tokens: u64,
    usage: UsageUpdate,
    completed_tool_uses: usize,
    wrap_open: bool,
    sent_role: bool,
}

impl OpenAiEmitter {
    pub fn new(
        completion_id: impl Into<String>,
        model: impl Into<String>,
        created: i64,
        mode: ThinkingMode,
        name_map: ToolNameMap,
        notice: Option<String>,
        estimated_input_tokens: u64,
    ) -> Self {
        Self {
            id: completion_id.into(),
            model: model.into(),
            created,
            mode,
            scanner: TagScanner::new(),
            assembler: ToolUseAssembler::new(),
            name_map,
            notice,
            estimated_input_tokens,
            usage: UsageUpdate::default(),
            completed_tool_uses: 0,
            wrap_open: false,
            sent_role: false,
        }
    }

    /// Authoritative usage seen so far (for the global counters).
    pub fn usage(&self) -> UsageUpdate {
        self.usage
    }

    /// Translate one upstream event into zero or more SSE chunks.
    pub fn push(&mut self, event: &UpstreamEvent) -> String {
        let mut out = String::new();
        match event {
            UpstreamEvent::MessageStart | UpstreamEvent::MessageStop => {}
            UpstreamEvent::AssistantDelta { content } => {
                if self.mode == ThinkingMode::ReasoningContent {
                    let mut runs: Vec<(Channel, String)> = Vec::new();
                    self.scanner
                        .push(content, &mut |channel, text| runs.push((channel, text.to_string())));
                    for (channel, text) in runs {
                        self.emit_run(&mut out, channel, &text);
                    }
                } else {
                    self.emit_run(&mut out, Channel::Text, content);
                }
            }
            UpstreamEvent::ReasoningDelta { content } => match self.mode.wrap_tags() {
                None => self.emit_run(&mut out, Channel::Reasoning, content),
                Some((open_tag, _)) => {
                    if !self.wrap_open {
                        out.push_str(&self.content_chunk(open_tag));
                        self.wrap_open = true;
                    }
                    out.push_str(&self.content_chunk(content));
                }
            },
            UpstreamEvent::ToolUse(fragment) => {
                if let Some(done) = self.assembler.push(fragment) {
                    let index = self.completed_tool_uses;
                    self.completed_tool_uses += 1;
                    let delta = json!({
                        "tool_calls": [{
                            "index": index,
                            "id": done.id,
                            "type": "function",
                            "function": {
                                "name": self.name_map.original(&done.name),
                                "arguments": done.input.to_string()
                            }
                        }]
                    });
                    out.push_str(&self.chunk(delta, None, None));
                }
            }
            UpstreamEvent::Usage(update) => merge_usage(&mut self.usage, update),
            UpstreamEvent::Auxiliary { .. } => {}
            UpstreamEvent::UpstreamError { kind, message } => {
                let body = json!({"error": {"type": kind, "message": message}});
                out.push_str(&format!("data: {body}\n\n"));
            }
        }
        out
    }

    /// Close the stream: flush the scanner, inject the notice, emit the
    /// final chunk with finish_reason + usage, then `[DONE]`.
    pub fn finish(mut self) -> String {
        let mut out = String::new();

        let mut runs: Vec<(Channel, String)> = Vec::new();
        self.scanner
            .finish(&mut |channel, text| runs.push((channel, text.to_string())));
        for (channel, text) in runs {
            self.emit_run(&mut out, channel, &text);
        }

        let reason = stop_reason(self.completed_tool_uses, self.assembler.saw_truncated());

        if reason == StopReason::EndTurn {
            if let Some(notice) = self.notice.take() {
                out.push_str(&self.content_chunk(&notice));
            }
        }
        if self.wrap_open {
            if let Some((_, close_tag)) = self.mode.wrap_tags() {
                out.push_str(&self.content_chunk(close_tag));
            }
            self.wrap_open = false;
        }

        let usage = usage_object(&self.usage, self.estimated_input_tokens);
        out.push_str(&self.chunk(json!({}), Some(reason.as_openai()), Some(usage)));
        out.push_str("data: [DONE]\n\n");
        out
    }

    fn emit_run(&mut self, out: &mut String, channel: Channel, text: &str) {
        if text.is_empty() {
            return;
        }
        match channel {
            Channel::Text => {
                if self.wrap_open {
                    if let Some((_, close_tag)) = self.mode.wrap_tags() {
                        out.push_str(&self.content_chunk(close_tag));
                    }
                    self.wrap_open = false;
                }
                out.push_str(&self.content_chunk(text));
            }
            Channel::Reasoning => {
                out.push_str(&self.chunk(json!({"reasoning_content": text}), None, None));
            }
        }
    }

    fn content_chunk(&mut self, text: &str) -> String {
        self.chunk(json!({"content": text}), None, None)
    }

    fn chunk(&mut self, mut delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> String {
        // the first delta of the stream carries the assistant role
        if !self.sent_role {
            self.sent_role = true;
            if let Some(map) = delta.as_object_mut() {
                map.insert("role".to_string(), Value::from("assistant"));
            }
        }
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        format!("data: {body}\n\n")
    }
}

fn usage_object(usage: &UsageUpdate, estimated_input: u64) -> Value {
    let prompt = if usage.input_tokens > 0 {
        usage.input_tokens
    } else {
        estimated_input.max(1)
    };
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": usage.output_tokens,
        "total_tokens": prompt + usage.output_tokens,
        "prompt_tokens_details": {
            "cached_tokens": usage.cache_read_tokens
        },
        "completion_tokens_details": {
            "reasoning_tokens": usage.reasoning_tokens
        }
    })
}

/// Batched (non-streaming) chat-completion response body.
pub fn batch_response(
    completion_id: &str,
    model: &str,
    created: i64,
    collected: &crate::collect::CollectedResponse,
    name_map: &ToolNameMap,
    mode: ThinkingMode,
    notice: Option<&str>,
) -> Value {
    let reason = collected.stop_reason();

    let mut content = String::new();
    if !collected.reasoning.is_empty() {
        if let Some((open_tag, close_tag)) = mode.wrap_tags() {
            content.push_str(open_tag);
            content.push_str(&collected.reasoning);
            content.push_str(close_tag);
        }
    }
    content.push_str(&collected.text);
    if reason == StopReason::EndTurn {
        if let Some(notice) = notice {
            content.push_str(notice);
        }
    }

    let mut message = json!({
        "role": "assistant",
        "content": content
    });
    if mode == ThinkingMode::ReasoningContent && !collected.reasoning.is_empty() {
        message["reasoning_content"] = Value::from(collected.reasoning.clone());
    }
    if !collected.tool_uses.is_empty() {
        let calls: Vec<Value> = collected
            .tool_uses
            .iter()
            .enumerate()
            .map(|(index, tool_use)| {
                json!({
                    "index": index,
                    "id": tool_use.id,
                    "type": "function",
                    "function": {
                        "name": name_map.original(&tool_use.name),
                        "arguments": tool_use.input.to_string()
                    }
                })
            })
            .collect();
        message["tool_calls"] = Value::Array(calls);
    }

    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": reason.as_openai()
        }],
        "usage": usage_object(&collected.usage, 1)
    })
}
