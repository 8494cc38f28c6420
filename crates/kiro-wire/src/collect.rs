//! Response assembly shared by the streaming emitters and the batch path.
//!
//! Upstream may fragment a tool-use input JSON across frames; fragments are
//! buffered per tool-use id and parsed only when the terminating frame
//! arrives. A buffer marked truncated is dropped and forces the final stop
//! reason to `max_tokens`.

use serde_json::Value;
use tracing::debug;

use crate::chat::ToolUse;
use crate::eventstream::{ToolUseFragment, UpstreamEvent, UsageUpdate};

/// Terminal stop reason in canonical (Anthropic) vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    pub fn as_anthropic(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
        }
    }

    pub fn as_openai(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "stop",
            StopReason::ToolUse => "tool_calls",
            StopReason::MaxTokens => "length",
        }
    }
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Buffers fragmented tool-use frames until their terminating frame.
#[derive(Debug, Default)]
pub struct ToolUseAssembler {
    pending: Vec<PendingToolUse>,
    truncated_seen: bool,
}

impl ToolUseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the completed tool-use when this fragment
    /// terminates it. Truncated fragments drop their buffer entirely.
    pub fn push(&mut self, fragment: &ToolUseFragment) -> Option<ToolUse> {
        if fragment.truncated {
            debug!(tool_use_id = %fragment.tool_use_id, "truncated tool use dropped");
            self.truncated_seen = true;
            self.pending.retain(|p| p.id != fragment.tool_use_id);
            return None;
        }

        let entry = match self.pending.iter_mut().find(|p| p.id == fragment.tool_use_id) {
            Some(entry) => entry,
            None => {
                self.pending.push(PendingToolUse {
                    id: fragment.tool_use_id.clone(),
                    ..Default::default()
                });
                self.pending.last_mut()?
            }
        };
        if !fragment.name.is_empty() {
            entry.name = fragment.name.clone();
        }
        entry.input_json.push_str(&fragment.input);

        if !fragment.stop {
            return None;
        }

        let done = {
            let index = self.pending.iter().position(|p| p.id == fragment.tool_use_id)?;
            self.pending.swap_remove(index)
        };
        let input: Value = if done.input_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&done.input_json).unwrap_or_else(|e| {
                debug!(tool_use_id = %done.id, error = %e, "unparsable tool input; defaulting to empty object");
                Value::Object(Default::default())
            })
        };
        Some(ToolUse {
            id: done.id,
            name: done.name,
            input,
        })
    }

    /// Any truncated tool-use converts the final stop reason to max_tokens.
    pub fn saw_truncated(&self) -> bool {
        self.truncated_seen
    }
}

/// Stop reason from the assembled response shape: tool calls win over plain
/// text; truncation wins over everything.
pub fn stop_reason(completed_tool_uses: usize, saw_truncated: bool) -> StopReason {
    if saw_truncated {
        StopReason::MaxTokens
    } else if completed_tool_uses > 0 {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    }
}

/// Fully aggregated response for the non-streaming paths.
#[derive(Debug, Default)]
pub struct CollectedResponse {
    pub text: String,
    pub reasoning: String,
    pub tool_uses: Vec<ToolUse>,
    pub usage: UsageUpdate,
    pub truncated: bool,
    pub upstream_error: Option<(String, String)>,
}

impl CollectedResponse {
    pub fn stop_reason(&self) -> StopReason {
        stop_reason(self.tool_uses.len(), self.truncated)
    }
}

/// Consume upstream events into an aggregated response.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    response: CollectedResponse,
    assembler: ToolUseAssembler,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::AssistantDelta { content } => self.response.text.push_str(content),
            UpstreamEvent::ReasoningDelta { content } => {
                self.response.reasoning.push_str(content)
            }
            UpstreamEvent::ToolUse(fragment) => {
                if let Some(done) = self.assembler.push(fragment) {
                    self.response.tool_uses.push(done);
                }
            }
            UpstreamEvent::Usage(usage) => merge_usage(&mut self.response.usage, usage),
            UpstreamEvent::UpstreamError { kind, message } => {
                self.response.upstream_error = Some((kind.clone(), message.clone()));
            }
            UpstreamEvent::MessageStart
            | UpstreamEvent::MessageStop
            | UpstreamEvent::Auxiliary { .. } => {}
        }
    }

    pub fn finish(mut self) -> CollectedResponse {
        self.response.truncated = self.assembler.saw_truncated();
        self.response
    }
}

/// Later usage events carry cumulative authoritative counts; keep the
/// largest value seen per dimension.
pub fn merge_usage(current: &mut UsageUpdate, update: &UsageUpdate) {
    current.input_tokens = current.input_tokens.max(update.input_tokens);
    current.output_tokens = current.output_tokens.max(update.output_tokens);
    current.cache_read_tokens = current.cache_read_tokens.max(update.cache_read_tokens);
    current.cache_write_tokens = current.cache_write_tokens.max(update.cache_write_tokens);
    current.reasoning_tokens = current.reasoning_tokens.max(update.reasoning_tokens);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: &str, name: &str, input: &str, stop: bool, truncated: bool) -> ToolUseFragment {
        ToolUseFragment {
            tool_use_id: id.into(),
            name: name.into(),
            input: input.into(),
            stop,
            truncated,
        }
    }

    #[test]
    fn single_frame_tool_use() {
        let mut assembler = ToolUseAssembler::new();
        let done = assembler
            .push(&fragment("tu_1", "search", r#"{"q":"rust"}"#, true, false))
            .unwrap();
        assert_eq!(done.name, "search");
        assert_eq!(done.input["q"], "rust");
    }

    #[test]
    fn fragmented_input_is_parsed_only_at_stop() {
        let mut assembler = ToolUseAssembler::new();
        assert!(assembler
            .push(&fragment("tu_1", "search", r#"{"q":"#, false, false))
            .is_none());
        assert!(assembler
            .push(&fragment("tu_1", "", r#""ru"#, false, false))
            .is_none());
        let done = assembler
            .push(&fragment("tu_1", "", r#"st"}"#, true, false))
            .unwrap();
        assert_eq!(done.input["q"], "rust");
        assert_eq!(done.name, "search");
    }

    #[test]
    fn interleaved_tool_uses_keep_separate_buffers() {
        let mut assembler = ToolUseAssembler::new();
        assembler.push(&fragment("a", "one", r#"{"x":"#, false, false));
        assembler.push(&fragment("b", "two", r#"{"y":2}"#, false, false));
        let done_a = assembler.push(&fragment("a", "", "1}", true, false)).unwrap();
        let done_b = assembler.push(&fragment("b", "", "", true, false)).unwrap();
        assert_eq!(done_a.input["x"], 1);
        assert_eq!(done_b.input["y"], 2);
    }

    #[test]
    fn truncated_buffer_is_dropped() {
        let mut assembler = ToolUseAssembler::new();
        assembler.push(&fragment("tu_1", "search", r#"{"q":"ru"#, false, false));
        assert!(assembler
            .push(&fragment("tu_1", "", "", true, true))
            .is_none());
        assert!(assembler.saw_truncated());
    }

    #[test]
    fn empty_input_defaults_to_object() {
        let mut assembler = ToolUseAssembler::new();
        let done = assembler.push(&fragment("tu_1", "ping", "", true, false)).unwrap();
        assert_eq!(done.input, serde_json::json!({}));
    }

    #[test]
    fn stop_reason_precedence() {
        assert_eq!(stop_reason(0, false), StopReason::EndTurn);
        assert_eq!(stop_reason(2, false), StopReason::ToolUse);
        assert_eq!(stop_reason(2, true), StopReason::MaxTokens);
        assert_eq!(stop_reason(0, true), StopReason::MaxTokens);
    }

    #[test]
    fn stop_reason_vocabularies() {
        assert_eq!(StopReason::EndTurn.as_anthropic(), "end_turn");
        assert_eq!(StopReason::EndTurn.as_openai(), "stop");
        assert_eq!(StopReason::ToolUse.as_openai(), "tool_calls");
        assert_eq!(StopReason::MaxTokens.as_openai(), "length");
    }

    #[test]
    fn collector_aggregates_a_stream() {
        let mut collector = ResponseCollector::new();
        collector.push(&UpstreamEvent::MessageStart);
        collector.push(&UpstreamEvent::AssistantDelta {
            content: "Hello ".into(),
        });
        collector.push(&UpstreamEvent::AssistantDelta {
            content: "world".into(),
        });
        collector.push(&UpstreamEvent::ReasoningDelta {
            content: "hmm".into(),
        });
        collector.push(&UpstreamEvent::Usage(UsageUpdate {
            input_tokens: 10,
            output_tokens: 4,
            ..Default::default()
        }));
        collector.push(&UpstreamEvent::Usage(UsageUpdate {
            input_tokens: 10,
            output_tokens: 9,
            ..Default::default()
        }));
        collector.push(&UpstreamEvent::MessageStop);

        let response = collector.finish();
        assert_eq!(response.text, "Hello world");
        assert_eq!(response.reasoning, "hmm");
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.output_tokens, 9);
        assert_eq!(response.stop_reason(), StopReason::EndTurn);
    }

    #[test]
    fn collector_tracks_truncation_in_stop_reason() {
        let mut collector = ResponseCollector::new();
        collector.push(&UpstreamEvent::ToolUse(fragment(
            "tu_1", "search", "{", false, false,
        )));
        collector.push(&UpstreamEvent::ToolUse(fragment("tu_1", "", "", true, true)));
        let response = collector.finish();
        assert!(response.tool_uses.is_empty());
        assert_eq!(response.stop_reason(), StopReason::MaxTokens);
    }
}
