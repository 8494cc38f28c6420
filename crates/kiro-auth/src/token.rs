use chrono::Utc;
use serde::{Deserialize, Serialize};

use kiro_core::config::{TOKEN_EXPIRY_MARGIN_SECS, DEFAULT_REGION};

/// Which identity provider issued the credentials.
///
/// Builder ID accounts refresh through the Kiro desktop-auth endpoint;
/// enterprise SSO accounts refresh through the region's OIDC token endpoint
/// using their registered client id/secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    #[default]
    BuilderId,
    IdentityCenter,
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuilderId => write!(f, "builder-id"),
            Self::IdentityCenter => write!(f, "identity-center"),
        }
    }
}

/// An account's exclusively-owned access credential set.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: String,
    /// OIDC client credentials — present for Identity Center accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub provider: AuthProvider,
    /// Unix timestamp (seconds) of the true expiry.
    pub expires_at: i64,
    /// Unix timestamp (seconds) when the token was issued.
    pub issued_at: i64,
}

impl AccessToken {
    /// Expired for selection purposes: five minutes before true expiry, so a
    /// refresh round-trip fits before the credential actually dies.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() + TOKEN_EXPIRY_MARGIN_SECS >= self.expires_at
    }

    /// Past the true expiry — the credential is no longer usable even as a
    /// fallback while a refresh is failing transiently.
    pub fn is_hard_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

// Credentials never appear in logs or error payloads.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("client_id", &self.client_id.as_ref().map(|_| "[REDACTED]"))
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("region", &self.region)
            .field("provider", &self.provider)
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: i64) -> AccessToken {
        let now = Utc::now().timestamp();
        AccessToken {
            access_token: "aoaAt.secret".into(),
            refresh_token: "aoaRt.secret".into(),
            client_id: None,
            client_secret: None,
            region: "us-east-1".into(),
            provider: AuthProvider::BuilderId,
            expires_at: now + expires_in_secs,
            issued_at: now,
        }
    }

    #[test]
    fn fresh_token_is_not_expired() {
        assert!(!token(3600).is_expired());
    }

    #[test]
    fn token_inside_margin_counts_as_expired() {
        // 4 minutes left < 5 minute margin
        let t = token(240);
        assert!(t.is_expired());
        assert!(!t.is_hard_expired());
    }

    #[test]
    fn hard_expiry() {
        let t = token(-10);
        assert!(t.is_expired());
        assert!(t.is_hard_expired());
    }

    #[test]
    fn debug_redacts_credentials() {
        let s = format!("{:?}", token(3600));
        assert!(s.contains("[REDACTED]"));
        assert!(!s.contains("secret"));
    }

    #[test]
    fn deserializes_vendor_camel_case() {
        let json = r#"{
            "accessToken": "at",
            "refreshToken": "rt",
            "expiresAt": 1800000000,
            "issuedAt": 1799990000
        }"#;
        let t: AccessToken = serde_json::from_str(json).unwrap();
        assert_eq!(t.region, "us-east-1");
        assert_eq!(t.provider, AuthProvider::BuilderId);
        assert!(t.expires_at > t.issued_at);
    }
}
