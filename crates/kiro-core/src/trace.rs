//! Per-request trace identity and context bag.
//!
//! Every inbound request gets a `msg_id` that is echoed in the `X-Msg-ID`
//! response header and stamped on every correlated log record. The context
//! bag is request-scoped: it is built once per request and dropped with it,
//! so per-request flags can never leak between requests.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::config::ERROR_BODY_CAP;

/// Trace identifier: `msg_<nanos>_<8-byte hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MsgId(pub String);

impl MsgId {
    pub fn mint() -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("msg_{}_{}", nanos, &hex[..16]))
    }

    /// Use a client-supplied identifier (`X-Request-ID`) verbatim.
    pub fn from_client(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request-scoped context carried through the orchestration pipeline.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub msg_id: MsgId,
    pub client_addr: String,
    /// Original request body, truncated for error reporting.
    pub body_excerpt: String,
    pub received_at: DateTime<Utc>,
    /// Resolved once account selection has happened.
    pub account_id: Option<String>,
    /// Set when the request carries the debug marker; upgrades log emission
    /// from suppressed to full for this request only.
    pub debug: bool,
    /// Set when the operational notice must be injected into this response.
    pub inject_notice: bool,
}

impl TraceContext {
    pub fn new(msg_id: MsgId, client_addr: impl Into<String>, body: &[u8]) -> Self {
        Self {
            msg_id,
            client_addr: client_addr.into(),
            body_excerpt: excerpt(body),
            received_at: Utc::now(),
            account_id: None,
            debug: false,
            inject_notice: false,
        }
    }
}

/// Truncate a body for error reporting, marking the cut.
pub fn excerpt(body: &[u8]) -> String {
    if body.len() <= ERROR_BODY_CAP {
        String::from_utf8_lossy(body).into_owned()
    } else {
        let mut end = ERROR_BODY_CAP;
        // back off to a char boundary
        while end > 0 && !body.is_char_boundary_at(end) {
            end -= 1;
        }
        let mut s = String::from_utf8_lossy(&body[..end]).into_owned();
        s.push_str("[truncated]");
        s
    }
}

trait CharBoundary {
    fn is_char_boundary_at(&self, index: usize) -> bool;
}

impl CharBoundary for [u8] {
    fn is_char_boundary_at(&self, index: usize) -> bool {
        if index == 0 || index >= self.len() {
            return true;
        }
        // UTF-8 continuation bytes are 0b10xx_xxxx
        self[index] & 0xC0 != 0x80
    }
}
