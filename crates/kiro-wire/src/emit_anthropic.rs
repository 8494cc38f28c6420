//! Anthropic-dialect SSE emission.
//!
//! Maintains the content-block lifecycle: an index and the currently open
//! block type. Switching block type closes the open block and starts the
//! next before any delta is emitted. End of stream closes the last block,
//! emits `message_delta` with the stop reason, then `message_stop`.

use serde_json::{json, Value};

use crate::collect::{merge_usage, stop_reason, StopReason, ToolUseAssembler};
use crate::eventstream::{UpstreamEvent, UsageUpdate};
use crate::thinking::{Channel, TagScanner, ThinkingMode};
use crate::tools::ToolNameMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
}

pub struct AnthropicEmitter {
    msg_id: String,
    model: String,
    mode: ThinkingMode,
    scanner: TagScanner,
    assembler: ToolUseAssembler,
    name_map: ToolNameMap,
    /// Rendered notice to inject into the final text block, at most once.
    notice: Option<String>,
    estimated_input_tokens: u64,
    block_index: usize,
    open_block: Option<OpenBlock>,
    /// In tag-wrap modes: an unclosed wrap tag inside the open text block.
    wrap_open: bool,
    started: bool,
    usage: UsageUpdate,
    completed_tool_uses: usize,
}

impl AnthropicEmitter {
    pub fn new(
        msg_id: impl Into<String>,
        model: impl Into<String>,
        mode: ThinkingMode,
        name_map: ToolNameMap,
        notice: Option<String>,
        estimated_input_tokens: u64,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            model: model.into(),
            mode,
            scanner: TagScanner::new(),
            assembler: ToolUseAssembler::new(),
            name_map,
            notice,
            estimated_input_tokens,
            block_index: 0,
            open_block: None,
            wrap_open: false,
            started: false,
            usage: UsageUpdate::default(),
            completed_tool_uses: 0,
        }
    }

    /// Authoritative usage seen so far (for the global counters).
    pub fn usage(&self) -> UsageUpdate {
        self.usage
    }

    /// Translate one upstream event into zero or more SSE events.
    pub fn push(&mut self, event: &UpstreamEvent) -> String {
        let mut out = String::new();
        self.ensure_started(&mut out);

        match event {
            UpstreamEvent::MessageStart | UpstreamEvent::MessageStop => {}
            UpstreamEvent::AssistantDelta { content } => {
                if self.mode == ThinkingMode::ReasoningContent {
                    // plain text may carry inline <thinking> tags
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
                    self.ensure_block(&mut out, OpenBlock::Text);
                    if !self.wrap_open {
                        out.push_str(&self.text_delta(open_tag));
                        self.wrap_open = true;
                    }
                    out.push_str(&self.text_delta(content));
                }
            },
            UpstreamEvent::ToolUse(fragment) => {
                if let Some(done) = self.assembler.push(fragment) {
                    self.close_open_block(&mut out);
                    self.completed_tool_uses += 1;
                    let original_name = self.name_map.original(&done.name);
                    out.push_str(&sse(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": done.id,
                                "name": original_name,
                                "input": {}
                            }
                        }),
                    ));
                    out.push_str(&sse(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {
                                "type": "input_json_delta",
                                "partial_json": done.input.to_string()
                            }
                        }),
                    ));
                    out.push_str(&sse(
                        "content_block_stop",
                        &json!({
                            "type": "content_block_stop",
                            "index": self.block_index
                        }),
                    ));
                    self.block_index += 1;
                }
            }
            UpstreamEvent::Usage(update) => merge_usage(&mut self.usage, update),
            UpstreamEvent::Auxiliary { .. } => {}
            UpstreamEvent::UpstreamError { kind, message } => {
                out.push_str(&sse(
                    "error",
                    &json!({
                        "type": "error",
                        "error": {"type": kind, "message": message}
                    }),
                ));
            }
        }
        out
    }

    /// Close the stream: flush the scanner, inject the notice into the
    /// final text block when applicable, close the open block, and emit
    /// `message_delta` + `message_stop`.
    pub fn finish(mut self) -> String {
        let mut out = String::new();
        self.ensure_started(&mut out);

        let mut runs: Vec<(Channel, String)> = Vec::new();
        self.scanner
            .finish(&mut |channel, text| runs.push((channel, text.to_string())));
        for (channel, text) in runs {
            self.emit_run(&mut out, channel, &text);
        }

        let reason = stop_reason(self.completed_tool_uses, self.assembler.saw_truncated());

        // the notice goes inside the final text block, immediately before
        // it closes; never into tool-use or thinking blocks, never on a
        // tool-call response
        if reason == StopReason::EndTurn {
            if let Some(notice) = self.notice.take() {
                self.ensure_block(&mut out, OpenBlock::Text);
                out.push_str(&self.text_delta(&notice));
            }
        }

        self.close_open_block(&mut out);

        out.push_str(&sse(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": reason.as_anthropic(), "stop_sequence": null},
                "usage": {"output_tokens": self.usage.output_tokens}
            }),
        ));
        out.push_str(&sse("message_stop", &json!({"type": "message_stop"})));
        out
    }

    fn ensure_started(&mut self, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        let input_tokens = if self.usage.input_tokens > 0 {
            self.usage.input_tokens
        } else {
            self.estimated_input_tokens.max(1)
        };
        out.push_str(&sse(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.msg_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0}
                }
            }),
        ));
    }

    fn emit_run(&mut self, out: &mut String, channel: Channel, text: &str) {
        if text.is_empty() {
            return;
        }
        match channel {
            Channel::Text => {
                self.ensure_block(out, OpenBlock::Text);
                if self.wrap_open {
                    if let Some((_, close_tag)) = self.mode.wrap_tags() {
                        out.push_str(&self.text_delta(close_tag));
                    }
                    self.wrap_open = false;
                }
                out.push_str(&self.text_delta(text));
            }
            Channel::Reasoning => {
                self.ensure_block(out, OpenBlock::Thinking);
                out.push_str(&sse(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "thinking_delta", "thinking": text}
                    }),
                ));
            }
        }
    }

    fn ensure_block(&mut self, out: &mut String, wanted: OpenBlock) {
        if self.open_block == Some(wanted) {
            return;
        }
        self.close_open_block(out);
        let content_block = match wanted {
            OpenBlock::Text => json!({"type": "text", "text": ""}),
            OpenBlock::Thinking => json!({"type": "thinking", "thinking": ""}),
        };
        out.push_str(&sse(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.open_block = Some(wanted);
    }

    fn close_open_block(&mut self, out: &mut String) {
        if self.open_block.is_none() {
            return;
        }
        if self.wrap_open {
            if let Some((_, close_tag)) = self.mode.wrap_tags() {
                out.push_str(&self.text_delta(close_tag));
            }
            self.wrap_open = false;
        }
        out.push_str(&sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.block_index}),
        ));
        self.open_block = None;
        self.block_index += 1;
    }

    fn text_delta(&self, text: &str) -> String {
        sse(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": {"type": "text_delta", "text": text}
            }),
        )
    }
}

/// One SSE event in the Anthropic dialect: `event: <name>\ndata: <json>\n\n`.
fn sse(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Batched (non-streaming) Anthropic Messages response body.
pub fn batch_response(
    msg_id: &str,
    model: &str,
    collected: &crate::collect::CollectedResponse,
    name_map: &ToolNameMap,
    mode: ThinkingMode,
    notice: Option<&str>,
) -> Value {
    let reason = collected.stop_reason();
    let mut content = Vec::new();

    if !collected.reasoning.is_empty() {
        match mode.wrap_tags() {
            None => content.push(json!({"type": "thinking", "thinking": collected.reasoning})),
            Some((open_tag, close_tag)) => {
                // folded into text below
                let mut text = String::new();
                text.push_str(open_tag);
                text.push_str(&collected.reasoning);
                text.push_str(close_tag);
                content.push(json!({"type": "text", "text": text}));
            }
        }
    }

    let mut text = collected.text.clone();
    if reason == StopReason::EndTurn {
        if let Some(notice) = notice {
            text.push_str(notice);
        }
    }
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }

    for tool_use in &collected.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tool_use.id,
            "name": name_map.original(&tool_use.name),
            "input": tool_use.input
        }));
    }

    json!({
        "id": msg_id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": reason.as_anthropic(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": collected.usage.input_tokens,
            "output_tokens": collected.usage.output_tokens,
            "cache_read_input_tokens": collected.usage.cache_read_tokens,
            "cache_creation_input_tokens": collected.usage.cache_write_tokens
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::ToolUseFragment;

    fn emitter(notice: Option<String>) -> AnthropicEmitter {
        AnthropicEmitter::new(
            "msg_1_abc",
            "claude-sonnet-4.5",
            ThinkingMode::ReasoningContent,
            ToolNameMap::default(),
            notice,
            3,
        )
    }

    /// Extract `event:` names in order from framed SSE text.
    fn event_names(sse_text: &str) -> Vec<&str> {
        sse_text
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect()
    }

    #[test]
    fn text_stream_event_order() {
        let mut emitter = emitter(None);
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::MessageStart));
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "Hello".into(),
        }));
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: " world".into(),
        }));
        out.push_str(&emitter.push(&UpstreamEvent::Usage(UsageUpdate {
            input_tokens: 3,
            output_tokens: 2,
            ..Default::default()
        })));
        out.push_str(&emitter.finish());

        assert_eq!(
            event_names(&out),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(out.contains(r#""stop_reason":"end_turn""#));
        assert!(out.contains(r#""output_tokens":2"#));
    }

    #[test]
    fn message_start_reports_input_tokens() {
        let mut emitter = emitter(None);
        let out = emitter.push(&UpstreamEvent::AssistantDelta { content: "x".into() });
        assert!(out.contains(r#""input_tokens":3"#));
    }

    #[test]
    fn inline_thinking_switches_blocks() {
        let mut emitter = emitter(None);
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "a<thinking>b</thinking>c".into(),
        }));
        out.push_str(&emitter.finish());

        let names = event_names(&out);
        // text block, thinking block, text block: three start/stop pairs
        assert_eq!(names.iter().filter(|n| **n == "content_block_start").count(), 3);
        assert_eq!(names.iter().filter(|n| **n == "content_block_stop").count(), 3);
        assert!(out.contains(r#""thinking_delta""#));
        assert!(out.contains(r#""thinking":"b""#));
    }

    #[test]
    fn reasoning_delta_uses_thinking_block() {
        let mut emitter = emitter(None);
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::ReasoningDelta {
            content: "pondering".into(),
        }));
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "answer".into(),
        }));
        out.push_str(&emitter.finish());

        assert!(out.contains(r#""type":"thinking""#));
        assert!(out.contains(r#""thinking":"pondering""#));
        assert!(out.contains(r#""text":"answer""#));
    }

    #[test]
    fn think_wrap_mode_folds_reasoning_into_text() {
        let mut emitter = AnthropicEmitter::new(
            "msg_1",
            "m",
            ThinkingMode::Think,
            ToolNameMap::default(),
            None,
            1,
        );
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::ReasoningDelta {
            content: "why".into(),
        }));
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "because".into(),
        }));
        out.push_str(&emitter.finish());

        assert!(out.contains(r#""text":"<think>""#));
        assert!(out.contains(r#""text":"why""#));
        assert!(out.contains(r#""text":"</think>""#));
        assert!(!out.contains("thinking_delta"));
    }

    #[test]
    fn tool_use_block_lifecycle_and_stop_reason() {
        let mut name_map = ToolNameMap::default();
        name_map.register("my.tool");
        let mut emitter = AnthropicEmitter::new(
            "msg_1",
            "m",
            ThinkingMode::ReasoningContent,
            name_map,
            None,
            1,
        );

        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "Using tool.".into(),
        }));
        out.push_str(&emitter.push(&UpstreamEvent::ToolUse(ToolUseFragment {
            tool_use_id: "tu_1".into(),
            name: "my_tool".into(),
            input: r#"{"q":1}"#.into(),
            stop: true,
            truncated: false,
        })));
        out.push_str(&emitter.finish());

        // the text block closed before the tool_use block opened
        assert!(out.contains(r#""name":"my.tool""#));
        assert!(out.contains(r#""partial_json":"{\"q\":1}""#));
        assert!(out.contains(r#""stop_reason":"tool_use""#));
    }

    #[test]
    fn truncated_tool_use_forces_max_tokens() {
        let mut emitter = emitter(None);
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::ToolUse(ToolUseFragment {
            tool_use_id: "tu_1".into(),
            name: "t".into(),
            input: "{".into(),
            stop: false,
            truncated: true,
        })));
        out.push_str(&emitter.finish());
        assert!(out.contains(r#""stop_reason":"max_tokens""#));
    }

    #[test]
    fn notice_lands_in_final_text_block() {
        let mut emitter = emitter(Some("\n\n> maintenance `abc123`".into()));
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::AssistantDelta {
            content: "Done.".into(),
        }));
        out.push_str(&emitter.finish());

        assert!(out.contains("maintenance"));
        // injected before the block closes, after the real content
        let notice_pos = out.find("maintenance").unwrap();
        let stop_pos = out.rfind("content_block_stop").unwrap();
        assert!(notice_pos < stop_pos);
    }

    #[test]
    fn notice_suppressed_on_tool_call_responses() {
        let mut emitter = AnthropicEmitter::new(
            "msg_1",
            "m",
            ThinkingMode::ReasoningContent,
            ToolNameMap::default(),
            Some("NOTICE".into()),
            1,
        );
        let mut out = String::new();
        out.push_str(&emitter.push(&UpstreamEvent::ToolUse(ToolUseFragment {
            tool_use_id: "tu_1".into(),
            name: "t".into(),
            input: "{}".into(),
            stop: true,
            truncated: false,
        })));
        out.push_str(&emitter.finish());
        assert!(!out.contains("NOTICE"));
    }

    #[test]
    fn upstream_error_becomes_sse_error_event() {
        let mut emitter = emitter(None);
        let out = emitter.push(&UpstreamEvent::UpstreamError {
            kind: "ThrottlingException".into(),
            message: "slow down".into(),
        });
        assert!(out.contains("event: error"));
        assert!(out.contains("ThrottlingException"));
    }

    #[test]
    fn batch_response_shape() {
        let mut collector = crate::collect::ResponseCollector::new();
        collector.push(&UpstreamEvent::AssistantDelta {
            content: "hi".into(),
        });
        collector.push(&UpstreamEvent::Usage(UsageUpdate {
            input_tokens: 5,
            output_tokens: 2,
            ..Default::default()
        }));
        let collected = collector.finish();

        let body = batch_response(
            "msg_1",
            "claude-sonnet-4.5",
            &collected,
            &ToolNameMap::default(),
            ThinkingMode::ReasoningContent,
            None,
        );
        assert_eq!(body["type"], "message");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["content"][0]["text"], "hi");
        assert_eq!(body["usage"]["input_tokens"], 5);
        assert_eq!(body["usage"]["output_tokens"], 2);
    }
}
