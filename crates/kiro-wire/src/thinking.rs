//! Thinking-block re-encoding.
//!
//! The config selects how model reasoning reaches the client:
//! `reasoning_content` emits it on a separate channel, `thinking` / `think`
//! wrap it in the corresponding tag inside the text stream. In
//! `reasoning_content` mode, plain text deltas are additionally scanned for
//! inline `<thinking>` tags, which switch the current output channel; the
//! scanner buffers partial tag matches so correctness survives arbitrary
//! chunk boundaries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    /// Emit reasoning on a separate content channel (default).
    #[default]
    ReasoningContent,
    /// Wrap reasoning in `<thinking>…</thinking>` inside the text stream.
    Thinking,
    /// Wrap reasoning in `<think>…</think>` inside the text stream.
    Think,
}

impl ThinkingMode {
    /// Tags used when reasoning is folded into the text stream; `None` for
    /// the separate-channel mode.
    pub fn wrap_tags(&self) -> Option<(&'static str, &'static str)> {
        match self {
            ThinkingMode::ReasoningContent => None,
            ThinkingMode::Thinking => Some(("<thinking>", "</thinking>")),
            ThinkingMode::Think => Some(("<think>", "</think>")),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reasoning_content" => Some(ThinkingMode::ReasoningContent),
            "thinking" => Some(ThinkingMode::Thinking),
            "think" => Some(ThinkingMode::Think),
            _ => None,
        }
    }
}

/// Output channel for a run of scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Text,
    Reasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    Inside,
}

/// Stateful scanner splitting a text stream into text and reasoning runs on
/// inline `<thinking>` tags. Partial tag matches are buffered across
/// `push` calls; `finish` flushes whatever remains as literal text.
#[derive(Debug)]
pub struct TagScanner {
    state: ScanState,
    buf: String,
    open: &'static str,
    close: &'static str,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Outside,
            buf: String::new(),
            open: "<thinking>",
            close: "</thinking>",
        }
    }

    fn channel(&self) -> Channel {
        match self.state {
            ScanState::Outside => Channel::Text,
            ScanState::Inside => Channel::Reasoning,
        }
    }

    fn active_tag(&self) -> &'static str {
        match self.state {
            ScanState::Outside => self.open,
            ScanState::Inside => self.close,
        }
    }

    /// Feed a chunk, emitting completed runs to the callback.
    pub fn push(&mut self, chunk: &str, emit: &mut impl FnMut(Channel, &str)) {
        self.buf.push_str(chunk);

        loop {
            let tag = self.active_tag();
            if let Some(idx) = self.buf.find(tag) {
                if idx > 0 {
                    emit(self.channel(), &self.buf[..idx]);
                }
                self.buf.drain(..idx + tag.len());
                self.state = match self.state {
                    ScanState::Outside => ScanState::Inside,
                    ScanState::Inside => ScanState::Outside,
                };
                continue;
            }

            // No full tag: emit everything except a trailing run that could
            // still become the tag on the next chunk.
            let keep = longest_tag_prefix_suffix(&self.buf, tag);
            let emit_len = self.buf.len() - keep;
            if emit_len > 0 {
                emit(self.channel(), &self.buf[..emit_len]);
                self.buf.drain(..emit_len);
            }
            break;
        }
    }

    /// Flush the scanner at end of stream. A dangling partial tag is
    /// literal text at that point.
    pub fn finish(&mut self, emit: &mut impl FnMut(Channel, &str)) {
        if !self.buf.is_empty() {
            let channel = self.channel();
            let rest = std::mem::take(&mut self.buf);
            emit(channel, &rest);
        }
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
/// Tags are ASCII, so a matching suffix always begins on a char boundary.
fn longest_tag_prefix_suffix(buf: &str, tag: &str) -> usize {
    let buf_bytes = buf.as_bytes();
    let tag_bytes = tag.as_bytes();
    let max = buf_bytes.len().min(tag_bytes.len() - 1);
    for k in (1..=max).rev() {
        if tag_bytes.starts_with(&buf_bytes[buf_bytes.len() - k..]) {
            return k;
        }
    }
    0
}
