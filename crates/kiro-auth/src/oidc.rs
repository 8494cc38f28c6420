//! OIDC device-flow login and token refresh against the vendor endpoints.
//!
//! Login flow:
//!   1. Dynamic client registration (`/client/register`).
//!   2. Device authorization (`/device_authorization`) — yields the user
//!      code and verification URL shown to the operator.
//!   3. Token polling (`/token`) at the server-hinted interval until the
//!      user authorizes out-of-band, the code expires, or access is denied.
//!
//! Refresh goes through the region OIDC token endpoint for Identity Center
//! accounts and the desktop-auth refresh endpoint for Builder ID accounts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use kiro_core::config::{desktop_refresh_endpoint, oidc_endpoint, REFRESH_TIMEOUT_SECS};
use kiro_core::{GatewayError, Result};

use crate::token::{AccessToken, AuthProvider};

const CLIENT_NAME: &str = "kiro-gateway";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_GRANT: &str = "refresh_token";
const BUILDER_ID_START_URL: &str = "https://view.awsapps.com/start";
const SCOPES: &[&str] = &[
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
];

/// Short-lived record of an in-progress device-flow login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginSession {
    pub session_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_at: DateTime<Utc>,
    /// Current polling interval; grows when the server hints `slow_down`.
    pub interval_secs: u64,
    pub region: String,
    pub provider: AuthProvider,
    #[serde(skip)]
    pub device_code: String,
    #[serde(skip)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: String,
    #[serde(skip)]
    pub sso_start_url: Option<String>,
}

impl LoginSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Exponential back-off honoring a `slow_down` hint (capped at 30 s).
    pub fn slow_down(&mut self) {
        self.interval_secs = (self.interval_secs * 2).min(30);
    }
}

/// One poll of the token endpoint for a pending login.
#[derive(Debug)]
pub enum LoginPoll {
    /// Authorization still outstanding — poll again after the interval.
    Pending,
    /// Server asked for a slower cadence; the session interval was doubled.
    SlowDown,
    /// The user authorized; credentials are ready.
    Complete(AccessToken),
    /// The device code expired before authorization.
    Expired,
    /// Hard failure (access denied or protocol error).
    Failed(String),
}

/// Outcome of one refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(AccessToken),
    /// The refresh credential itself was rejected — the account needs
    /// re-login and must not be retried automatically.
    InvalidGrant(String),
    /// Network trouble or a 5xx — the previous token stays usable until its
    /// true expiry.
    Transient(String),
}

pub struct OidcClient {
    http: reqwest::Client,
}

impl Default for OidcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OidcClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Register a client and start device authorization, producing a login
    /// session the operator can complete out-of-band.
    pub async fn start_login(
        &self,
        region: &str,
        sso_start_url: Option<&str>,
    ) -> Result<LoginSession> {
        let base = oidc_endpoint(region);

        let reg: ClientRegistration = self
            .post_json(
                &format!("{base}/client/register"),
                &serde_json::json!({
                    "clientName": CLIENT_NAME,
                    "clientType": "public",
                    "scopes": SCOPES,
                }),
            )
            .await?;

        debug!(region, "OIDC client registered");

        let start_url = sso_start_url.unwrap_or(BUILDER_ID_START_URL);
        let auth: DeviceAuthorization = self
            .post_json(
                &format!("{base}/device_authorization"),
                &serde_json::json!({
                    "clientId": reg.client_id,
                    "clientSecret": reg.client_secret,
                    "startUrl": start_url,
                }),
            )
            .await?;

        let provider = if sso_start_url.is_some() {
            AuthProvider::IdentityCenter
        } else {
            AuthProvider::BuilderId
        };

        Ok(LoginSession {
            session_id: Uuid::new_v4().to_string(),
            user_code: auth.user_code,
            verification_uri: auth.verification_uri,
            verification_uri_complete: auth.verification_uri_complete.unwrap_or_default(),
            expires_at: Utc::now() + ChronoDuration::seconds(auth.expires_in),
            interval_secs: auth.interval.max(1) as u64,
            region: region.to_string(),
            provider,
            device_code: auth.device_code,
            client_id: reg.client_id,
            client_secret: reg.client_secret,
            sso_start_url: sso_start_url.map(String::from),
        })
    }

    /// Poll the token endpoint once for a pending login session.
    pub async fn poll_login(&self, session: &LoginSession) -> LoginPoll {
        if session.is_expired() {
            return LoginPoll::Expired;
        }

        let url = format!("{}/token", oidc_endpoint(&session.region));
        let body = serde_json::json!({
            "clientId": session.client_id,
            "clientSecret": session.client_secret,
            "deviceCode": session.device_code,
            "grantType": DEVICE_GRANT,
        });

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return LoginPoll::Failed(e.to_string()),
        };

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            match serde_json::from_str::<TokenResponse>(&text) {
                Ok(tok) => {
                    let now = Utc::now().timestamp();
                    LoginPoll::Complete(AccessToken {
                        access_token: tok.access_token,
                        refresh_token: tok.refresh_token.unwrap_or_default(),
                        client_id: Some(session.client_id.clone()),
                        client_secret: Some(session.client_secret.clone()),
                        region: session.region.clone(),
                        provider: session.provider,
                        expires_at: now + tok.expires_in,
                        issued_at: now,
                    })
                }
                Err(e) => LoginPoll::Failed(format!("malformed token response: {e}")),
            }
        } else {
            match classify_device_error(&text) {
                DeviceError::AuthorizationPending => LoginPoll::Pending,
                DeviceError::SlowDown => LoginPoll::SlowDown,
                DeviceError::ExpiredToken => LoginPoll::Expired,
                DeviceError::Other(reason) => {
                    warn!(status, %reason, "device-flow poll failed");
                    LoginPoll::Failed(reason)
                }
            }
        }
    }

    /// Refresh an access token through the provider-appropriate endpoint.
    pub async fn refresh(&self, token: &AccessToken) -> RefreshOutcome {
        match token.provider {
            AuthProvider::IdentityCenter => self.refresh_identity_center(token).await,
            AuthProvider::BuilderId => self.refresh_builder_id(token).await,
        }
    }

    async fn refresh_identity_center(&self, token: &AccessToken) -> RefreshOutcome {
        let url = format!("{}/token", oidc_endpoint(&token.region));
        let body = serde_json::json!({
            "clientId": token.client_id,
            "clientSecret": token.client_secret,
            "refreshToken": token.refresh_token,
            "grantType": REFRESH_GRANT,
        });

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return RefreshOutcome::Transient(e.to_string()),
        };

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            match serde_json::from_str::<TokenResponse>(&text) {
                Ok(tok) => RefreshOutcome::Refreshed(rotate(token, tok)),
                Err(e) => RefreshOutcome::Transient(format!("malformed refresh response: {e}")),
            }
        } else {
            classify_refresh_failure(status, &text)
        }
    }

    async fn refresh_builder_id(&self, token: &AccessToken) -> RefreshOutcome {
        let url = desktop_refresh_endpoint(&token.region);
        let body = serde_json::json!({ "refreshToken": token.refresh_token });

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return RefreshOutcome::Transient(e.to_string()),
        };

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            match serde_json::from_str::<TokenResponse>(&text) {
                Ok(tok) => RefreshOutcome::Refreshed(rotate(token, tok)),
                Err(e) => RefreshOutcome::Transient(format!("malformed refresh response: {e}")),
            }
        } else {
            classify_refresh_failure(status, &text)
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status,
                message: text,
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))
    }
}

/// Build the rotated token, carrying forward fields the endpoint omits.
fn rotate(prev: &AccessToken, resp: TokenResponse) -> AccessToken {
    let now = Utc::now().timestamp();
    AccessToken {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token.unwrap_or_else(|| prev.refresh_token.clone()),
        client_id: prev.client_id.clone(),
        client_secret: prev.client_secret.clone(),
        region: prev.region.clone(),
        provider: prev.provider,
        expires_at: now + resp.expires_in,
        issued_at: now,
    }
}

/// 4xx responses that name the refresh credential as invalid require a
/// re-login; everything else is transient and keeps the prior token alive.
fn classify_refresh_failure(status: u16, body: &str) -> RefreshOutcome {
    if (400..500).contains(&status) && is_invalid_grant(body) {
        RefreshOutcome::InvalidGrant(body.to_string())
    } else {
        RefreshOutcome::Transient(format!("refresh returned {status}: {body}"))
    }
}

fn is_invalid_grant(body: &str) -> bool {
    body.contains("invalid_grant")
        || body.contains("InvalidGrantException")
        || body.contains("invalid_client")
        || body.contains("UnauthorizedClientException")
}

enum DeviceError {
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    Other(String),
}

fn classify_device_error(body: &str) -> DeviceError {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
        #[serde(default, rename = "error_description")]
        description: String,
    }

    let parsed: ErrorBody = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(_) => {
            // AWS also reports exceptions by class name outside the OAuth shape
            if body.contains("AuthorizationPendingException") {
                return DeviceError::AuthorizationPending;
            }
            if body.contains("SlowDownException") {
                return DeviceError::SlowDown;
            }
            if body.contains("ExpiredTokenException") {
                return DeviceError::ExpiredToken;
            }
            return DeviceError::Other(body.to_string());
        }
    };

    match parsed.error.as_str() {
        "authorization_pending" => DeviceError::AuthorizationPending,
        "slow_down" => DeviceError::SlowDown,
        "expired_token" => DeviceError::ExpiredToken,
        _ => DeviceError::Other(if parsed.description.is_empty() {
            parsed.error
        } else {
            parsed.description
        }),
    }
}

// OIDC endpoint response types (private — deserialization only)

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration {
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: i64,
    #[serde(default = "default_interval")]
    interval: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_interval() -> i64 {
    5
}

fn default_expires_in() -> i64 {
    3600
}
