use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::AccessToken;

/// A backing account in the pool.
///
/// Accounts are mutated only by the credential store (token rotation) and by
/// the admin surface (add/delete). Everything else sees read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub user_id: String,
    /// Upstream resource selector sent with every chat request.
    #[serde(default)]
    pub profile_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_start_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub token: Option<AccessToken>,
    /// Set when the refresh credential was rejected as invalid; the account
    /// is selection-ineligible until re-imported or re-authorized.
    #[serde(default)]
    pub refresh_invalid: bool,
}

impl Account {
    pub fn new(email: impl Into<String>, token: AccessToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            user_id: String::new(),
            profile_arn: String::new(),
            sso_start_url: None,
            created_at: Utc::now(),
            token: Some(token),
            refresh_invalid: false,
        }
    }

    /// An account without a token can never be selected.
    pub fn has_usable_token(&self) -> bool {
        self.token.is_some() && !self.refresh_invalid
    }
}

/// Read-only view handed to the selector and observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub email: String,
    pub has_token: bool,
    pub refresh_invalid: bool,
}

impl From<&Account> for AccountSnapshot {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id.clone(),
            email: a.email.clone(),
            has_token: a.token.is_some(),
            refresh_invalid: a.refresh_invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::AuthProvider;

    fn sample_token() -> AccessToken {
        AccessToken {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            client_id: None,
            client_secret: None,
            region: "us-east-1".into(),
            provider: AuthProvider::BuilderId,
            expires_at: 2_000_000_000,
            issued_at: 1_999_990_000,
        }
    }

    #[test]
    fn new_account_is_usable() {
        let a = Account::new("dev@example.com", sample_token());
        assert!(a.has_usable_token());
        assert!(!a.id.is_empty());
    }

    #[test]
    fn tokenless_account_is_unusable() {
        let mut a = Account::new("dev@example.com", sample_token());
        a.token = None;
        assert!(!a.has_usable_token());
    }

    #[test]
    fn invalid_refresh_blocks_use() {
        let mut a = Account::new("dev@example.com", sample_token());
        a.refresh_invalid = true;
        assert!(!a.has_usable_token());
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut a = Account::new("dev@example.com", sample_token());
        a.refresh_invalid = true;
        let snap = AccountSnapshot::from(&a);
        assert_eq!(snap.email, "dev@example.com");
        assert!(snap.has_token);
        assert!(snap.refresh_invalid);
    }
}
