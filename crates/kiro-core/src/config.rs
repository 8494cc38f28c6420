use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Gateway-wide constants. Timing values are in seconds unless suffixed.
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_REGION: &str = "us-east-1";

/// A token is treated as expired this long before its true expiry, leaving
/// slack for the refresh round-trip.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;
/// Cadence of the background keep-alive refresh pass.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 300;
/// Independent timeout for a single token-refresh round-trip.
pub const REFRESH_TIMEOUT_SECS: u64 = 30;

// Error-rate statistic.
pub const BUCKET_WIDTH_SECS: u64 = 10;
pub const BUCKET_RETENTION_SECS: u64 = 300;
pub const MAX_BUCKETS: usize = 30;

// Circuit breaker.
pub const FAILURE_THRESHOLD: u32 = 5;
pub const ERROR_RATE_THRESHOLD: f64 = 0.5;
pub const MIN_SAMPLES: u64 = 10;
pub const COOLDOWN_SECS: u64 = 60;
pub const HALF_OPEN_SUCCESSES: u32 = 2;

// Load distribution.
pub const CLOSED_WEIGHT: u32 = 100;

// Request handling.
pub const RATE_WINDOW_SECS: u64 = 60;
/// Request bodies kept for error reporting are capped at this size.
pub const ERROR_BODY_CAP: usize = 10 * 1024;

/// Top-level config (kiro.toml + KIRO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub files: FilesConfig,
}

/// Response-shaping options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// How model reasoning reaches clients: `reasoning_content` (separate
    /// channel), `thinking`, or `think` (tag-wrapped in the text stream).
    #[serde(default = "default_thinking")]
    pub thinking: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            thinking: default_thinking(),
        }
    }
}

fn default_thinking() -> String {
    "reasoning_content".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Per-request timeout for the upstream chat call, in seconds.
    /// 0 disables the client-side timeout (streams can be long-lived).
    #[serde(default)]
    pub request_timeout_secs: u64,
    /// Enterprise override for the chat endpoint. Region routing applies
    /// when unset.
    #[serde(default)]
    pub endpoint_override: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            request_timeout_secs: 0,
            endpoint_override: None,
        }
    }
}

/// Locations of the persisted JSON snapshots, all relative to CWD by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_accounts_path")]
    pub accounts: String,
    #[serde(default = "default_token_stats_path")]
    pub token_stats: String,
    #[serde(default = "default_model_mapping_path")]
    pub model_mapping: String,
    #[serde(default = "default_notification_path")]
    pub notification: String,
    #[serde(default = "default_rate_limit_path")]
    pub rate_limit: String,
    #[serde(default = "default_ip_blacklist_path")]
    pub ip_blacklist: String,
    #[serde(default = "default_api_keys_path")]
    pub api_keys: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts_path(),
            token_stats: default_token_stats_path(),
            model_mapping: default_model_mapping_path(),
            notification: default_notification_path(),
            rate_limit: default_rate_limit_path(),
            ip_blacklist: default_ip_blacklist_path(),
            api_keys: default_api_keys_path(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            response: ResponseConfig::default(),
            files: FilesConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file with KIRO_* env var overrides.
    /// A missing file yields defaults; `PORT` is honored separately because
    /// deploy environments set it without the KIRO_ prefix.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("kiro.toml");

        let mut config: GatewayConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("KIRO_").split("_"))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }
        if let Ok(region) = std::env::var("KIRO_REGION") {
            if !region.is_empty() {
                config.upstream.region = region;
            }
        }

        Ok(config)
    }
}

/// Per-IP request rate limit, admin-owned snapshot (`rate-limit.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Optional penalty sleep applied to a request that breached the limit,
    /// in milliseconds. 0 disables the penalty.
    #[serde(default)]
    pub penalty_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_requests_per_minute(),
            penalty_ms: 0,
        }
    }
}

/// Operational-notice snapshot (`notification.json`).
/// `identity_tag` is content-derived from `message` so prior injections can
/// be detected in later conversation turns regardless of client
/// re-formatting. It is recomputed on load rather than trusted from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub identity_tag: String,
}

impl NotificationConfig {
    pub fn new(enabled: bool, message: impl Into<String>) -> Self {
        let message = message.into();
        let identity_tag = crate::store::content_hash(message.as_bytes());
        Self {
            enabled,
            message,
            identity_tag,
        }
    }

    /// Recompute the identity tag after deserialization or an admin edit.
    pub fn rehash(&mut self) {
        self.identity_tag = crate::store::content_hash(self.message.as_bytes());
    }
}

/// Client API keys snapshot (`api-keys.json`). Empty list disables auth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Blocked client addresses snapshot (`ip-blacklist.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpBlacklist {
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// OIDC token/registration endpoint for a region.
pub fn oidc_endpoint(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com")
}

/// Kiro desktop-auth refresh endpoint (Builder ID accounts).
pub fn desktop_refresh_endpoint(region: &str) -> String {
    format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
}

/// Vendor chat endpoint for a region.
pub fn chat_endpoint(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_region() -> String {
    DEFAULT_REGION.to_string()
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_accounts_path() -> String {
    "kiro-accounts.json".to_string()
}
fn default_token_stats_path() -> String {
    "token-stats.json".to_string()
}
fn default_model_mapping_path() -> String {
    "model-mapping.json".to_string()
}
fn default_notification_path() -> String {
    "notification.json".to_string()
}
fn default_rate_limit_path() -> String {
    "rate-limit.json".to_string()
}
fn default_ip_blacklist_path() -> String {
    "ip-blacklist.json".to_string()
}
fn default_api_keys_path() -> String {
    "api-keys.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.region, "us-east-1");
        assert_eq!(config.files.accounts, "kiro-accounts.json");
    }

    #[test]
    fn region_endpoints() {
        assert_eq!(
            oidc_endpoint("eu-central-1"),
            "https://oidc.eu-central-1.amazonaws.com"
        );
        assert!(chat_endpoint("us-east-1").contains("codewhisperer.us-east-1"));
        assert!(desktop_refresh_endpoint("us-east-1").ends_with("/refreshToken"));
    }

    #[test]
    fn notification_tag_tracks_message() {
        let a = NotificationConfig::new(true, "maintenance window tonight");
        let b = NotificationConfig::new(true, "maintenance window tonight");
        let c = NotificationConfig::new(true, "different message");
        assert_eq!(a.identity_tag, b.identity_tag);
        assert_ne!(a.identity_tag, c.identity_tag);
        assert_eq!(a.identity_tag.len(), 16);
    }
}
