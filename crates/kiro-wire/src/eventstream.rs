//! AWS EventStream binary framing.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! [u32 total length | u32 headers length | headers | payload | u32 CRC-32]
//! ```
//!
//! The CRC covers everything before it (prelude + headers + payload).
//! Headers are `{u8 name-len, name, u8 value-type, value}` records. The
//! decoder is incremental: bytes arrive in arbitrary chunks, frames are
//! yielded as soon as they are complete, and frames failing the CRC check
//! are logged and skipped.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use tracing::{debug, warn};

/// Minimum structurally valid frame: empty headers, empty payload.
const MIN_FRAME_LEN: usize = 12;
/// Upper bound guarding against a corrupt length prelude.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    BoolTrue,
    BoolFalse,
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Vec<u8>),
    String(String),
    /// Milliseconds since the epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name == name).and_then(|h| {
            if let HeaderValue::String(ref s) = h.value {
                Some(s.as_str())
            } else {
                None
            }
        })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Yield the next complete, CRC-valid frame, or `None` when more bytes
    /// are needed. Frames with a bad CRC are skipped; a corrupt length
    /// prelude abandons the rest of the buffer (resync is impossible).
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.buf.len() < MIN_FRAME_LEN {
                return None;
            }

            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total) {
                warn!(total, "corrupt frame length; dropping stream buffer");
                self.buf.clear();
                return None;
            }
            if self.buf.len() < total {
                return None;
            }

            let frame = self.buf.split_to(total).freeze();
            let crc_stored = u32::from_be_bytes([
                frame[total - 4],
                frame[total - 3],
                frame[total - 2],
                frame[total - 1],
            ]);
            let crc_actual = crc32fast::hash(&frame[..total - 4]);
            if crc_actual != crc_stored {
                warn!(expected = crc_stored, actual = crc_actual, "frame CRC mismatch; skipping");
                continue;
            }

            let headers_len =
                u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
            if 8 + headers_len + 4 > total {
                warn!(headers_len, total, "header length exceeds frame; skipping");
                continue;
            }

            let headers = parse_headers(&frame[8..8 + headers_len]);
            let payload = frame.slice(8 + headers_len..total - 4);
            return Some(Frame { headers, payload });
        }
    }
}

fn parse_headers(mut bytes: &[u8]) -> Vec<Header> {
    let mut headers = Vec::new();
    while bytes.has_remaining() {
        let name_len = bytes.get_u8() as usize;
        if bytes.remaining() < name_len + 1 {
            debug!("truncated header record; ignoring remainder");
            break;
        }
        let name = String::from_utf8_lossy(&bytes[..name_len]).into_owned();
        bytes.advance(name_len);

        let value_type = bytes.get_u8();
        let value = match value_type {
            0 => HeaderValue::BoolTrue,
            1 => HeaderValue::BoolFalse,
            2 if bytes.remaining() >= 1 => HeaderValue::Byte(bytes.get_u8()),
            3 if bytes.remaining() >= 2 => HeaderValue::Int16(bytes.get_i16()),
            4 if bytes.remaining() >= 4 => HeaderValue::Int32(bytes.get_i32()),
            5 if bytes.remaining() >= 8 => HeaderValue::Int64(bytes.get_i64()),
            6 if bytes.remaining() >= 2 => {
                let len = bytes.get_u16() as usize;
                if bytes.remaining() < len {
                    debug!("truncated byte-array header; ignoring remainder");
                    break;
                }
                let value = bytes[..len].to_vec();
                bytes.advance(len);
                HeaderValue::ByteArray(value)
            }
            7 if bytes.remaining() >= 2 => {
                let len = bytes.get_u16() as usize;
                if bytes.remaining() < len {
                    debug!("truncated string header; ignoring remainder");
                    break;
                }
                let value = String::from_utf8_lossy(&bytes[..len]).into_owned();
                bytes.advance(len);
                HeaderValue::String(value)
            }
            8 if bytes.remaining() >= 8 => HeaderValue::Timestamp(bytes.get_i64()),
            9 if bytes.remaining() >= 16 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&bytes[..16]);
                bytes.advance(16);
                HeaderValue::Uuid(uuid)
            }
            other => {
                debug!(value_type = other, "unknown header value type; ignoring remainder");
                break;
            }
        };
        headers.push(Header { name, value });
    }
    headers
}

/// Encode a frame (the exact inverse of the decoder). Serves test fixtures
/// and protocol tooling; the gateway itself only decodes.
pub fn encode_frame(headers: &[(&str, HeaderValue)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        match value {
            HeaderValue::BoolTrue => header_bytes.push(0),
            HeaderValue::BoolFalse => header_bytes.push(1),
            HeaderValue::Byte(v) => {
                header_bytes.push(2);
                header_bytes.push(*v);
            }
            HeaderValue::Int16(v) => {
                header_bytes.push(3);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int32(v) => {
                header_bytes.push(4);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int64(v) => {
                header_bytes.push(5);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::ByteArray(v) => {
                header_bytes.push(6);
                header_bytes.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_bytes.extend_from_slice(v);
            }
            HeaderValue::String(v) => {
                header_bytes.push(7);
                header_bytes.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_bytes.extend_from_slice(v.as_bytes());
            }
            HeaderValue::Timestamp(v) => {
                header_bytes.push(8);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Uuid(v) => {
                header_bytes.push(9);
                header_bytes.extend_from_slice(v);
            }
        }
    }

    let total = 8 + header_bytes.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Encode a JSON event frame the way the vendor emits them.
pub fn encode_event(event_type: &str, payload: &serde_json::Value) -> Vec<u8> {
    let body = payload.to_string();
    encode_frame(
        &[
            (":message-type", HeaderValue::String("event".to_string())),
            (":event-type", HeaderValue::String(event_type.to_string())),
            (":content-type", HeaderValue::String("application/json".to_string())),
        ],
        body.as_bytes(),
    )
}

/// A fragment of a tool-use spread over one or more frames. `input` is a
/// partial JSON string assembled by the caller; `stop` marks the final
/// fragment; `truncated` marks an upstream-abandoned tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolUseFragment {
    pub tool_use_id: String,
    pub name: String,
    pub input: String,
    pub stop: bool,
    pub truncated: bool,
}

/// Authoritative token counts, emitted at least once per response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageUpdate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Decoded upstream event, dispatched on the `:event-type` header.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    MessageStart,
    MessageStop,
    AssistantDelta { content: String },
    ReasoningDelta { content: String },
    ToolUse(ToolUseFragment),
    Usage(UsageUpdate),
    /// Recorded but not surfaced to clients.
    Auxiliary { kind: String },
    /// Exception frame delivered in-stream.
    UpstreamError { kind: String, message: String },
}

/// Interpret a decoded frame. Unknown event kinds are dropped with a debug
/// record; the payload is parsed on demand per variant.
pub fn parse_event(frame: &Frame) -> Option<UpstreamEvent> {
    if frame.message_type() == Some("exception") || frame.message_type() == Some("error") {
        let kind = frame
            .header_str(":exception-type")
            .or_else(|| frame.header_str(":error-code"))
            .unwrap_or("unknown")
            .to_string();
        let message = String::from_utf8_lossy(&frame.payload).into_owned();
        return Some(UpstreamEvent::UpstreamError { kind, message });
    }

    let event_type = frame.event_type()?;
    match event_type {
        "messageStart" => Some(UpstreamEvent::MessageStart),
        "messageStop" => Some(UpstreamEvent::MessageStop),
        "assistantResponseEvent" => {
            let body: AssistantResponsePayload = parse_payload(frame)?;
            Some(UpstreamEvent::AssistantDelta {
                content: body.content,
            })
        }
        "reasoningContentEvent" => {
            let body: ReasoningPayload = parse_payload(frame)?;
            Some(UpstreamEvent::ReasoningDelta {
                content: body.content,
            })
        }
        "toolUseEvent" => {
            let body: ToolUsePayload = parse_payload(frame)?;
            Some(UpstreamEvent::ToolUse(ToolUseFragment {
                tool_use_id: body.tool_use_id,
                name: body.name,
                input: body.input,
                stop: body.stop,
                truncated: body.truncated,
            }))
        }
        "usageEvent" => {
            let body: UsagePayload = parse_payload(frame)?;
            Some(UpstreamEvent::Usage(UsageUpdate {
                input_tokens: body.input_tokens,
                output_tokens: body.output_tokens,
                cache_read_tokens: body.cache_read_tokens,
                cache_write_tokens: body.cache_write_tokens,
                reasoning_tokens: body.reasoning_tokens,
            }))
        }
        "supplementaryWebLinksEvent"
        | "codeReferenceEvent"
        | "followupPromptEvent"
        | "citationEvent"
        | "contextUsageEvent"
        | "invalidStateEvent" => Some(UpstreamEvent::Auxiliary {
            kind: event_type.to_string(),
        }),
        other => {
            debug!(event_type = other, "unknown upstream event kind");
            None
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(frame: &Frame) -> Option<T> {
    match serde_json::from_slice(&frame.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event_type = ?frame.event_type(), error = %e, "unparsable event payload");
            None
        }
    }
}

// Event payload shapes (private — deserialization only)

#[derive(Deserialize)]
struct AssistantResponsePayload {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ReasoningPayload {
    #[serde(default, alias = "reasoningContent")]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUsePayload {
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsagePayload {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_tokens: u64,
    #[serde(default)]
    cache_write_tokens: u64,
    #[serde(default)]
    reasoning_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let frame_bytes = encode_event("assistantResponseEvent", &json!({"content": "hello"}));
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);

        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(frame.message_type(), Some("event"));

        match parse_event(&frame).unwrap() {
            UpstreamEvent::AssistantDelta { content } => assert_eq!(content, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_resumes_across_split_chunks() {
        let frame_bytes = encode_event("assistantResponseEvent", &json!({"content": "split"}));
        let mut decoder = FrameDecoder::new();

        // feed one byte at a time; the frame appears only once complete
        for (i, byte) in frame_bytes.iter().enumerate() {
            decoder.extend(&[*byte]);
            if i < frame_bytes.len() - 1 {
                assert!(decoder.next_frame().is_none());
            }
        }
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut bytes = encode_event("messageStart", &json!({}));
        bytes.extend(encode_event("messageStop", &json!({})));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert!(matches!(
            parse_event(&decoder.next_frame().unwrap()),
            Some(UpstreamEvent::MessageStart)
        ));
        assert!(matches!(
            parse_event(&decoder.next_frame().unwrap()),
            Some(UpstreamEvent::MessageStop)
        ));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn bad_crc_frame_is_skipped() {
        let mut corrupt = encode_event("assistantResponseEvent", &json!({"content": "x"}));
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let good = encode_event("assistantResponseEvent", &json!({"content": "y"}));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&corrupt);
        decoder.extend(&good);

        // the corrupt frame is silently skipped; the good one comes through
        let frame = decoder.next_frame().unwrap();
        match parse_event(&frame).unwrap() {
            UpstreamEvent::AssistantDelta { content } => assert_eq!(content, "y"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn corrupt_length_drops_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(decoder.next_frame().is_none());
        // buffer abandoned; new valid frames still decode
        decoder.extend(&encode_event("messageStop", &json!({})));
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn header_value_types_round_trip() {
        let frame_bytes = encode_frame(
            &[
                ("flag", HeaderValue::BoolTrue),
                ("off", HeaderValue::BoolFalse),
                ("b", HeaderValue::Byte(7)),
                ("i16", HeaderValue::Int16(-3)),
                ("i32", HeaderValue::Int32(1234)),
                ("i64", HeaderValue::Int64(-99)),
                ("bin", HeaderValue::ByteArray(vec![1, 2, 3])),
                ("s", HeaderValue::String("text".into())),
                ("ts", HeaderValue::Timestamp(1_700_000_000_000)),
                ("id", HeaderValue::Uuid([9u8; 16])),
            ],
            b"payload",
        );
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);
        let frame = decoder.next_frame().unwrap();

        assert_eq!(frame.headers.len(), 10);
        assert_eq!(frame.headers[0].value, HeaderValue::BoolTrue);
        assert_eq!(frame.headers[4].value, HeaderValue::Int32(1234));
        assert_eq!(frame.headers[7].value, HeaderValue::String("text".into()));
        assert_eq!(frame.headers[9].value, HeaderValue::Uuid([9u8; 16]));
        assert_eq!(&frame.payload[..], b"payload");
    }

    #[test]
    fn exception_frame_becomes_upstream_error() {
        let frame_bytes = encode_frame(
            &[
                (":message-type", HeaderValue::String("exception".into())),
                (":exception-type", HeaderValue::String("ThrottlingException".into())),
            ],
            b"rate exceeded",
        );
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);
        let frame = decoder.next_frame().unwrap();
        match parse_event(&frame).unwrap() {
            UpstreamEvent::UpstreamError { kind, message } => {
                assert_eq!(kind, "ThrottlingException");
                assert_eq!(message, "rate exceeded");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn usage_event_parses_token_details() {
        let frame_bytes = encode_event(
            "usageEvent",
            &json!({
                "inputTokens": 12, "outputTokens": 34,
                "cacheReadTokens": 5, "cacheWriteTokens": 6, "reasoningTokens": 7
            }),
        );
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);
        let frame = decoder.next_frame().unwrap();
        match parse_event(&frame).unwrap() {
            UpstreamEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 34);
                assert_eq!(usage.cache_read_tokens, 5);
                assert_eq!(usage.cache_write_tokens, 6);
                assert_eq!(usage.reasoning_tokens, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn auxiliary_events_are_recorded_not_surfaced() {
        let frame_bytes = encode_event("citationEvent", &json!({"url": "https://x"}));
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);
        let frame = decoder.next_frame().unwrap();
        assert!(matches!(
            parse_event(&frame),
            Some(UpstreamEvent::Auxiliary { kind }) if kind == "citationEvent"
        ));
    }

    #[test]
    fn unknown_event_kind_is_dropped() {
        let frame_bytes = encode_event("brandNewEvent", &json!({}));
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes);
        let frame = decoder.next_frame().unwrap();
        assert!(parse_event(&frame).is_none());
    }
}
