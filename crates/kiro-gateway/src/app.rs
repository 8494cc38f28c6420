use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use kiro_auth::AccountStore;
use kiro_core::config::{ApiKeys, GatewayConfig, IpBlacklist, NotificationConfig, RateLimitConfig};
use kiro_core::{store as disk, Result};
use kiro_pool::{CircuitBreaker, ErrorStats, Selector};

use kiro_wire::model_map::ModelMap;
use kiro_wire::ThinkingMode;

use crate::layers::{self, RateLimiter};
use crate::upstream::UpstreamClient;
use crate::usage::{start_usage_drainer, UsageCounters};

/// Central shared state — passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub accounts: Arc<AccountStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub selector: Selector,
    pub model_map: ModelMap,
    pub upstream: UpstreamClient,
    pub usage: UsageCounters,
    pub rate_limiter: RateLimiter,
    pub thinking_mode: ThinkingMode,
    /// Admin-owned snapshots, replaced whole on reload.
    pub notice: RwLock<NotificationConfig>,
    pub api_keys: RwLock<ApiKeys>,
    pub ip_blacklist: RwLock<IpBlacklist>,
}

impl AppState {
    pub fn load(config: GatewayConfig, shutdown: CancellationToken) -> Result<Self> {
        let accounts = Arc::new(AccountStore::load(&config.files.accounts)?);
        let stats = Arc::new(ErrorStats::new());
        let breaker = Arc::new(CircuitBreaker::new(Arc::clone(&stats)));
        let selector = Selector::new(Arc::clone(&accounts), Arc::clone(&breaker));
        let model_map = ModelMap::load(&config.files.model_mapping)?;
        let upstream = UpstreamClient::new(&config.upstream);
        let usage = start_usage_drainer(config.files.token_stats.clone(), shutdown);

        let mut notice: NotificationConfig =
            read_snapshot(&config.files.notification).unwrap_or_default();
        notice.rehash();
        let api_keys: ApiKeys = read_snapshot(&config.files.api_keys).unwrap_or_default();
        let ip_blacklist: IpBlacklist =
            read_snapshot(&config.files.ip_blacklist).unwrap_or_default();
        let rate_config: RateLimitConfig =
            read_snapshot(&config.files.rate_limit).unwrap_or_default();

        let thinking_mode =
            ThinkingMode::parse(&config.response.thinking).unwrap_or_default();

        Ok(Self {
            accounts,
            breaker,
            selector,
            model_map,
            upstream,
            usage,
            rate_limiter: RateLimiter::new(rate_config),
            thinking_mode,
            notice: RwLock::new(notice),
            api_keys: RwLock::new(api_keys),
            ip_blacklist: RwLock::new(ip_blacklist),
            config,
        })
    }

    pub fn notice_snapshot(&self) -> NotificationConfig {
        self.notice
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn read_snapshot<T: serde::de::DeserializeOwned>(path: &str) -> Option<T> {
    if std::path::Path::new(path).exists() {
        disk::read_json(path).ok()
    } else {
        None
    }
}

/// Assemble the full router. The chat endpoints are api-key guarded and
/// rate limited; count_tokens is guarded only; the telemetry drain and
/// health probe are open.
pub fn build_router(state: Arc<AppState>) -> Router {
    let rate_limited = Router::new()
        .route(
            "/v1/chat/completions",
            post(crate::http::openai::chat_completions),
        )
        .route("/v1/messages", post(crate::http::anthropic::messages))
        .route(
            "/anthropic/v1/messages",
            post(crate::http::anthropic::messages),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            layers::rate_limit,
        ));

    let guarded = rate_limited
        .route(
            "/v1/messages/count_tokens",
            post(crate::http::anthropic::count_tokens),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            layers::client_guard,
        ));

    Router::new()
        .merge(guarded)
        .route(
            "/api/event_logging/batch",
            post(crate::http::misc::event_logging),
        )
        .route("/health", get(crate::http::misc::health))
        .layer(middleware::from_fn(layers::trace))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
