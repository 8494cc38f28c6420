//! Request middleware: trace identity, client guard (IP + API key), and
//! the per-IP fixed-window rate limit.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use kiro_core::config::{RateLimitConfig, RATE_WINDOW_SECS};
use kiro_core::trace::MsgId;
use kiro_core::GatewayError;

use crate::app::AppState;
use crate::http::error_response;

/// Assign the trace identifier and echo it back in `X-Msg-ID`.
/// A client-supplied `X-Request-ID` is used verbatim.
pub async fn trace(mut req: Request, next: Next) -> Response {
    let msg_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(MsgId::from_client)
        .unwrap_or_else(MsgId::mint);

    req.extensions_mut().insert(msg_id.clone());
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(msg_id.as_str()) {
        resp.headers_mut().insert("x-msg-id", value);
    }
    resp
}

/// API-key authentication, then the IP blacklist. An empty key list
/// disables auth; the key may arrive as `X-API-Key` or
/// `Authorization: Bearer …`.
pub async fn client_guard(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let msg_id = req.extensions().get::<MsgId>().cloned();

    // authentication first: a bad key answers 401 even from a blocked address
    let keys = {
        let api_keys = state
            .api_keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        api_keys.keys.clone()
    };
    if !keys.is_empty() {
        let supplied = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                req.headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            });
        let authorized = supplied.is_some_and(|s| keys.iter().any(|k| k == s));
        if !authorized {
            return error_response(
                msg_id.as_ref(),
                &GatewayError::Unauthenticated("missing or invalid API key".into()),
            );
        }
    }

    let blocked = {
        let blacklist = state
            .ip_blacklist
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        blacklist.blocked.iter().any(|b| b == &addr.ip().to_string())
    };
    if blocked {
        warn!(client = %addr.ip(), "blocked client address");
        return error_response(
            msg_id.as_ref(),
            &GatewayError::Forbidden("client address is blocked".into()),
        );
    }

    next.run(req).await
}

/// Fixed-window limiter on `/v1/*` chat endpoints.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let msg_id = req.extensions().get::<MsgId>().cloned();

    match state.rate_limiter.check(&addr.ip().to_string()) {
        RateDecision::Allowed => next.run(req).await,
        RateDecision::Limited { penalty_ms } => {
            debug!(client = %addr.ip(), "rate limit exhausted");
            if penalty_ms > 0 {
                tokio::time::sleep(Duration::from_millis(penalty_ms)).await;
            }
            error_response(msg_id.as_ref(), &GatewayError::TooManyRequests)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { penalty_ms: u64 },
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

/// Per-client fixed-window counter. The window rolls forward atomically on
/// the first request after the prior window ended (the DashMap entry guard
/// makes the read-roll-increment sequence exclusive per client).
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    pub fn check(&self, client: &str) -> RateDecision {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if !config.enabled {
            return RateDecision::Allowed;
        }

        let mut window = self.windows.entry(client.to_string()).or_insert(Window {
            start: Instant::now(),
            count: 0,
        });
        if window.start.elapsed() >= Duration::from_secs(RATE_WINDOW_SECS) {
            window.start = Instant::now();
            window.count = 0;
        }
        if window.count >= config.requests_per_minute {
            RateDecision::Limited {
                penalty_ms: config.penalty_ms,
            }
        } else {
            window.count += 1;
            RateDecision::Allowed
        }
    }

    /// Replace the limiter configuration (admin reload).
    pub fn reconfigure(&self, config: RateLimitConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_minute: limit,
            penalty_ms: 0,
        })
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..1000 {
            assert_eq!(limiter.check("1.2.3.4"), RateDecision::Allowed);
        }
    }

    #[test]
    fn counts_per_window() {
        let limiter = limiter(3);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(
            limiter.check("a"),
            RateDecision::Limited { penalty_ms: 0 }
        );
    }

    #[test]
    fn clients_are_independent() {
        let limiter = limiter(1);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));
    }

    #[test]
    fn window_rolls_forward() {
        let limiter = limiter(1);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));

        // simulate an expired window
        limiter.windows.get_mut("a").unwrap().start =
            Instant::now() - Duration::from_secs(RATE_WINDOW_SECS + 1);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
    }

    #[test]
    fn reconfigure_takes_effect() {
        let limiter = limiter(1);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));

        limiter.reconfigure(RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
    }
}
