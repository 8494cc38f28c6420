//! Account/credential store.
//!
//! Owns every account's access token and keeps stored tokens non-expired.
//! Locking is two-tier: a reader-writer lock around the account map, and a
//! per-account mutex around each account's fields. Token refresh happens
//! under the per-account mutex with a freshness re-check, so a concurrent
//! second caller never issues a duplicate refresh.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use kiro_core::config::KEEPALIVE_INTERVAL_SECS;
use kiro_core::{store as disk, GatewayError, Result};

use crate::account::{Account, AccountSnapshot};
use crate::oidc::{LoginPoll, LoginSession, OidcClient, RefreshOutcome};
use crate::token::{AccessToken, AuthProvider};

/// Everything the orchestrator needs to dispatch upstream on behalf of an
/// account.
#[derive(Debug, Clone)]
pub struct UpstreamCredentials {
    pub account_id: String,
    pub email: String,
    pub access_token: String,
    pub profile_arn: String,
    pub region: String,
}

/// Result of one `complete_login` poll.
#[derive(Debug)]
pub enum LoginOutcome {
    Pending { retry_after_secs: u64 },
    Complete(AccountSnapshot),
    Failed(String),
}

struct AccountSlot {
    inner: Mutex<Account>,
}

pub struct AccountStore {
    accounts: RwLock<HashMap<String, Arc<AccountSlot>>>,
    logins: DashMap<String, LoginSession>,
    oidc: OidcClient,
    path: PathBuf,
}

#[derive(Default, Serialize, Deserialize)]
struct AccountsFile {
    accounts: Vec<Account>,
}

impl AccountStore {
    /// Load the persisted store; a missing file starts an empty pool.
    /// `KIRO_ACCESS_TOKEN` / `KIRO_AUTH_TOKEN_PATH` may seed one account so
    /// the gateway can run without a store file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file: AccountsFile = if path.exists() {
            disk::read_json(&path)?
        } else {
            AccountsFile::default()
        };

        let mut map = HashMap::new();
        for account in file.accounts {
            map.insert(
                account.id.clone(),
                Arc::new(AccountSlot {
                    inner: Mutex::new(account),
                }),
            );
        }

        info!(count = map.len(), path = %path.display(), "account store loaded");

        let store = Self {
            accounts: RwLock::new(map),
            logins: DashMap::new(),
            oidc: OidcClient::new(),
            path,
        };
        store.bootstrap_from_env();
        Ok(store)
    }

    /// Re-read the persisted store, replacing the in-memory map.
    pub async fn reload(&self) -> Result<()> {
        let file: AccountsFile = disk::read_json(&self.path)?;
        let mut map = HashMap::new();
        for account in file.accounts {
            map.insert(
                account.id.clone(),
                Arc::new(AccountSlot {
                    inner: Mutex::new(account),
                }),
            );
        }
        *self.accounts.write().await = map;
        Ok(())
    }

    fn bootstrap_from_env(&self) {
        if let Ok(raw) = std::env::var("KIRO_ACCESS_TOKEN") {
            if !raw.is_empty() {
                let now = Utc::now().timestamp();
                let token = AccessToken {
                    access_token: raw,
                    refresh_token: String::new(),
                    client_id: None,
                    client_secret: None,
                    region: std::env::var("KIRO_REGION")
                        .unwrap_or_else(|_| kiro_core::config::DEFAULT_REGION.to_string()),
                    provider: AuthProvider::BuilderId,
                    // static env tokens are never refreshed; give them a
                    // generous lifetime and let the upstream reject them
                    expires_at: now + 365 * 24 * 3600,
                    issued_at: now,
                };
                let account = Account::new("env@local", token);
                info!(account_id = %account.id, "seeded account from KIRO_ACCESS_TOKEN");
                self.insert_blocking(account);
                return;
            }
        }

        if let Ok(path) = std::env::var("KIRO_AUTH_TOKEN_PATH") {
            if !path.is_empty() {
                match std::fs::read_to_string(&path) {
                    Ok(json) => match self.parse_import(&json, None) {
                        Ok(account) => {
                            info!(account_id = %account.id, %path, "seeded account from KIRO_AUTH_TOKEN_PATH");
                            self.insert_blocking(account);
                        }
                        Err(e) => warn!(%path, error = %e, "ignoring unparsable token file"),
                    },
                    Err(e) => warn!(%path, error = %e, "cannot read KIRO_AUTH_TOKEN_PATH"),
                }
            }
        }
    }

    // Used only during single-threaded startup, before the runtime fans out.
    fn insert_blocking(&self, account: Account) {
        let mut map = match self.accounts.try_write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        map.entry(account.id.clone()).or_insert_with(|| {
            Arc::new(AccountSlot {
                inner: Mutex::new(account),
            })
        });
    }

    async fn slot(&self, id: &str) -> Result<Arc<AccountSlot>> {
        self.accounts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NoSuchAccount(id.to_string()))
    }

    /// The non-expired access credential for an account, refreshing if the
    /// stored token is inside the expiry margin.
    pub async fn get_access_token(&self, id: &str) -> Result<String> {
        Ok(self.credentials_for(id).await?.access_token)
    }

    /// Full upstream credential set, refreshing the token if needed.
    pub async fn credentials_for(&self, id: &str) -> Result<UpstreamCredentials> {
        let slot = self.slot(id).await?;

        let (creds, dirty) = {
            let mut account = slot.inner.lock().await;

            let needs_refresh = match account.token.as_ref() {
                Some(token) => token.is_expired(),
                None => {
                    return Err(GatewayError::RefreshFailed(format!(
                        "account {id} has no token; re-login required"
                    )))
                }
            };

            let mut dirty = false;
            if needs_refresh {
                self.refresh_locked(&mut account).await?;
                dirty = true;
            }

            let token = account
                .token
                .as_ref()
                .ok_or_else(|| GatewayError::RefreshFailed(format!("account {id} lost its token")))?;

            (
                UpstreamCredentials {
                    account_id: account.id.clone(),
                    email: account.email.clone(),
                    access_token: token.access_token.clone(),
                    profile_arn: account.profile_arn.clone(),
                    region: token.region.clone(),
                },
                dirty,
            )
        };

        if dirty {
            self.persist().await?;
        }
        Ok(creds)
    }

    /// Force a refresh regardless of current expiry. Idempotent in effect:
    /// the resulting state is a fresh token either way.
    pub async fn refresh_account(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        {
            let mut account = slot.inner.lock().await;
            self.refresh_locked(&mut account).await?;
        }
        self.persist().await
    }

    /// Best-effort concurrent refresh across the whole pool. Individual
    /// failures are logged, never propagated.
    pub async fn refresh_all(&self) {
        let slots: Vec<(String, Arc<AccountSlot>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let refreshes = slots.into_iter().map(|(id, slot)| async move {
            let mut account = slot.inner.lock().await;
            if let Err(e) = self.refresh_locked(&mut account).await {
                warn!(account_id = %id, error = %e, "refresh-all: account refresh failed");
            }
        });
        futures_util::future::join_all(refreshes).await;

        if let Err(e) = self.persist().await {
            warn!(error = %e, "refresh-all: persist failed");
        }
    }

    /// Refresh the token of an already-locked account. On an invalid
    /// refresh credential the account is flagged for re-login; on transient
    /// failure the prior token stays in place (usable until true expiry).
    async fn refresh_locked(&self, account: &mut Account) -> Result<()> {
        if account.refresh_invalid {
            return Err(GatewayError::RefreshFailed(format!(
                "account {} requires re-login",
                account.id
            )));
        }
        let token = account.token.as_ref().ok_or_else(|| {
            GatewayError::RefreshFailed(format!("account {} has no token", account.id))
        })?;
        if token.refresh_token.is_empty() {
            return Err(GatewayError::RefreshFailed(format!(
                "account {} has no refresh credential",
                account.id
            )));
        }

        match self.oidc.refresh(token).await {
            RefreshOutcome::Refreshed(new_token) => {
                debug!(account_id = %account.id, expires_at = new_token.expires_at, "token refreshed");
                account.token = Some(new_token);
                Ok(())
            }
            RefreshOutcome::InvalidGrant(reason) => {
                warn!(account_id = %account.id, %reason, "refresh credential invalid; account needs re-login");
                account.refresh_invalid = true;
                Err(GatewayError::RefreshFailed(reason))
            }
            RefreshOutcome::Transient(reason) => {
                // keep the previous token; it may outlive the outage
                if account.token.as_ref().is_some_and(|t| !t.is_hard_expired()) {
                    debug!(account_id = %account.id, %reason, "transient refresh failure; keeping prior token");
                }
                Err(GatewayError::RefreshFailed(reason))
            }
        }
    }

    /// Begin a device-flow login. The returned session carries the user
    /// code and verification URL for the operator.
    pub async fn start_login(
        &self,
        region: &str,
        sso_start_url: Option<&str>,
    ) -> Result<LoginSession> {
        let session = self.oidc.start_login(region, sso_start_url).await?;
        self.logins.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Poll a pending login once. Completion admits the account and clears
    /// the session; expiry and hard failure also clear it.
    pub async fn complete_login(&self, session_id: &str) -> Result<LoginOutcome> {
        let session = self
            .logins
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("login session {session_id}")))?;

        match self.oidc.poll_login(&session).await {
            LoginPoll::Pending => Ok(LoginOutcome::Pending {
                retry_after_secs: session.interval_secs,
            }),
            LoginPoll::SlowDown => {
                let retry = if let Some(mut entry) = self.logins.get_mut(session_id) {
                    entry.slow_down();
                    entry.interval_secs
                } else {
                    session.interval_secs
                };
                Ok(LoginOutcome::Pending {
                    retry_after_secs: retry,
                })
            }
            LoginPoll::Complete(token) => {
                self.logins.remove(session_id);
                let mut account = Account::new(String::new(), token);
                account.sso_start_url = session.sso_start_url.clone();
                let snapshot = AccountSnapshot::from(&account);
                self.insert(account).await?;
                info!(account_id = %snapshot.id, "device-flow login completed");
                Ok(LoginOutcome::Complete(snapshot))
            }
            LoginPoll::Expired => {
                self.logins.remove(session_id);
                Ok(LoginOutcome::Failed("login session expired".to_string()))
            }
            LoginPoll::Failed(reason) => {
                self.logins.remove(session_id);
                Ok(LoginOutcome::Failed(reason))
            }
        }
    }

    /// Admit an externally obtained token triplet (and optional client
    /// registration for Identity Center refresh).
    pub async fn import_account(
        &self,
        token_json: &str,
        client_reg_json: Option<&str>,
    ) -> Result<AccountSnapshot> {
        let account = self.parse_import(token_json, client_reg_json)?;
        let snapshot = AccountSnapshot::from(&account);
        self.insert(account).await?;
        info!(account_id = %snapshot.id, "account imported");
        Ok(snapshot)
    }

    fn parse_import(&self, token_json: &str, client_reg_json: Option<&str>) -> Result<Account> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ImportedToken {
            access_token: String,
            refresh_token: String,
            #[serde(default)]
            expires_at: Option<i64>,
            #[serde(default)]
            expires_in: Option<i64>,
            #[serde(default)]
            region: Option<String>,
            #[serde(default)]
            profile_arn: Option<String>,
            #[serde(default)]
            email: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ImportedRegistration {
            client_id: String,
            client_secret: String,
        }

        let imported: ImportedToken = serde_json::from_str(token_json)
            .map_err(|e| GatewayError::InvalidRequest(format!("token JSON: {e}")))?;
        let registration: Option<ImportedRegistration> = match client_reg_json {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| GatewayError::InvalidRequest(format!("client registration JSON: {e}")))?,
            ),
            None => None,
        };

        let now = Utc::now().timestamp();
        let expires_at = imported
            .expires_at
            .or_else(|| imported.expires_in.map(|d| now + d))
            .unwrap_or(now + 3600);

        let provider = if registration.is_some() {
            AuthProvider::IdentityCenter
        } else {
            AuthProvider::BuilderId
        };

        let token = AccessToken {
            access_token: imported.access_token,
            refresh_token: imported.refresh_token,
            client_id: registration.as_ref().map(|r| r.client_id.clone()),
            client_secret: registration.map(|r| r.client_secret),
            region: imported
                .region
                .unwrap_or_else(|| kiro_core::config::DEFAULT_REGION.to_string()),
            provider,
            expires_at,
            issued_at: now,
        };

        let mut account = Account::new(imported.email.unwrap_or_default(), token);
        account.profile_arn = imported.profile_arn.unwrap_or_default();
        Ok(account)
    }

    async fn insert(&self, account: Account) -> Result<()> {
        {
            let mut map = self.accounts.write().await;
            map.insert(
                account.id.clone(),
                Arc::new(AccountSlot {
                    inner: Mutex::new(account),
                }),
            );
        }
        self.persist().await
    }

    /// Remove an account and its credentials.
    pub async fn delete_account(&self, id: &str) -> Result<()> {
        let removed = self.accounts.write().await.remove(id);
        if removed.is_none() {
            return Err(GatewayError::NoSuchAccount(id.to_string()));
        }
        self.persist().await
    }

    /// Read-only snapshots for selection and observability.
    pub async fn snapshots(&self) -> Vec<AccountSnapshot> {
        let slots: Vec<Arc<AccountSlot>> = {
            let map = self.accounts.read().await;
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let account = slot.inner.lock().await;
            out.push(AccountSnapshot::from(&*account));
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Periodic task refreshing any token inside the expiry margin. Uses a
    /// delayed-tick interval so passes never overlap.
    pub fn start_keep_alive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so startup stays fast
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("keep-alive refresh pass");
                store.keep_alive_pass().await;
            }
        })
    }

    async fn keep_alive_pass(&self) {
        let slots: Vec<(String, Arc<AccountSlot>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut dirty = false;
        for (id, slot) in slots {
            let mut account = slot.inner.lock().await;
            let within_margin = account
                .token
                .as_ref()
                .is_some_and(|t| t.is_expired() && !t.refresh_token.is_empty());
            if !within_margin || account.refresh_invalid {
                continue;
            }
            match self.refresh_locked(&mut account).await {
                Ok(()) => dirty = true,
                Err(e) => warn!(account_id = %id, error = %e, "keep-alive refresh failed"),
            }
        }

        if dirty {
            if let Err(e) = self.persist().await {
                warn!(error = %e, "keep-alive persist failed");
            }
        }
    }

    /// Snapshot all accounts and atomically rewrite the store file.
    async fn persist(&self) -> Result<()> {
        let slots: Vec<Arc<AccountSlot>> = {
            let map = self.accounts.read().await;
            map.values().cloned().collect()
        };
        let mut file = AccountsFile::default();
        for slot in slots {
            file.accounts.push(slot.inner.lock().await.clone());
        }
        file.accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        disk::write_json_atomic(&self.path, &file)
    }
}
