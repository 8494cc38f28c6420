//! Weighted, breaker-aware account selection.
//!
//! Weights derive from circuit state: Closed gets full weight, HalfOpen a
//! quarter (probing), Open none. Selection is a weighted random draw with
//! an exclusion set so a failed attempt can be retried on a different
//! account within the same request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use kiro_auth::AccountStore;
use kiro_core::config::CLOSED_WEIGHT;
use kiro_core::{GatewayError, Result};

use crate::breaker::{CircuitBreaker, CircuitState};

/// Identity of the account picked for a request — handed to the
/// orchestrator for logging and failure attribution.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedAccount {
    pub account_id: String,
    pub email: String,
}

/// One row of the steady-state load distribution snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LoadRow {
    pub account_id: String,
    pub email: String,
    pub weight: u32,
    pub percent: f64,
}

pub struct Selector {
    accounts: Arc<AccountStore>,
    breaker: Arc<CircuitBreaker>,
    last_selected: Mutex<Option<SelectedAccount>>,
}

impl Selector {
    pub fn new(accounts: Arc<AccountStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            accounts,
            breaker,
            last_selected: Mutex::new(None),
        }
    }

    pub fn weight_for(state: CircuitState) -> u32 {
        match state {
            CircuitState::Closed => CLOSED_WEIGHT,
            CircuitState::HalfOpen => (CLOSED_WEIGHT / 4).max(1),
            CircuitState::Open => 0,
        }
    }

    /// Pick an eligible account, skipping `exclude` (accounts already tried
    /// within this request).
    pub async fn select(&self, exclude: &HashSet<String>) -> Result<SelectedAccount> {
        let mut candidates = Vec::new();
        for snap in self.accounts.snapshots().await {
            if !snap.has_token || snap.refresh_invalid || exclude.contains(&snap.id) {
                continue;
            }
            let weight = Self::weight_for(self.breaker.state(&snap.id));
            if weight > 0 {
                candidates.push((snap, weight));
            }
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoAccountsAvailable);
        }

        let total: u32 = candidates.iter().map(|(_, w)| w).sum();
        let roll = rand::thread_rng().gen_range(0..total);
        let weights: Vec<u32> = candidates.iter().map(|(_, w)| *w).collect();
        let (snap, weight) = &candidates[pick_weighted(&weights, roll)];

        debug!(account_id = %snap.id, weight, "account selected");
        let selected = SelectedAccount {
            account_id: snap.id.clone(),
            email: snap.email.clone(),
        };
        *self
            .last_selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(selected.clone());
        Ok(selected)
    }

    /// Snapshot of the steady-state load distribution across eligible
    /// accounts. Percentages sum to 100 within rounding when any weight is
    /// non-zero.
    pub async fn load_distribution(&self) -> Vec<LoadRow> {
        let mut rows = Vec::new();
        for snap in self.accounts.snapshots().await {
            let weight = if snap.has_token && !snap.refresh_invalid {
                Self::weight_for(self.breaker.state(&snap.id))
            } else {
                0
            };
            rows.push(LoadRow {
                account_id: snap.id,
                email: snap.email,
                weight,
                percent: 0.0,
            });
        }

        let total: u32 = rows.iter().map(|r| r.weight).sum();
        if total > 0 {
            for row in &mut rows {
                row.percent = row.weight as f64 * 100.0 / total as f64;
            }
        }
        rows
    }

    /// Identity of the most recent selection (per-invocation handoff, not a
    /// sticky session).
    pub fn last_selected(&self) -> Option<SelectedAccount> {
        self.last_selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Walk the weight list until the roll falls inside a band.
/// `roll` must be in `0..weights.sum()`.
fn pick_weighted(weights: &[u32], roll: u32) -> usize {
    let mut acc = 0u32;
    for (index, w) in weights.iter().enumerate() {
        acc += w;
        if roll < acc {
            return index;
        }
    }
    weights.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ErrorStats;

    #[test]
    fn weights_by_state() {
        assert_eq!(Selector::weight_for(CircuitState::Closed), 100);
        assert_eq!(Selector::weight_for(CircuitState::HalfOpen), 25);
        assert_eq!(Selector::weight_for(CircuitState::Open), 0);
    }

    #[test]
    fn pick_weighted_bands() {
        let weights = [100, 25, 100];
        assert_eq!(pick_weighted(&weights, 0), 0);
        assert_eq!(pick_weighted(&weights, 99), 0);
        assert_eq!(pick_weighted(&weights, 100), 1);
        assert_eq!(pick_weighted(&weights, 124), 1);
        assert_eq!(pick_weighted(&weights, 125), 2);
        assert_eq!(pick_weighted(&weights, 224), 2);
    }

    async fn pool_with(n: usize, dir: &tempfile::TempDir) -> (Arc<AccountStore>, Vec<String>) {
        let store =
            Arc::new(AccountStore::load(dir.path().join("kiro-accounts.json")).unwrap());
        let mut ids = Vec::new();
        for i in 0..n {
            let snap = store
                .import_account(
                    &format!(
                        r#"{{"accessToken":"at{i}","refreshToken":"rt{i}","expiresIn":7200,
                            "email":"acct{i}@example.com"}}"#
                    ),
                    None,
                )
                .await
                .unwrap();
            ids.push(snap.id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn load_percents_sum_to_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ids) = pool_with(3, &dir).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        // vary the states: one half-open-bound account
        breaker.manual_trip(&ids[0]);
        let selector = Selector::new(store, Arc::clone(&breaker));

        let rows = selector.load_distribution().await;
        assert_eq!(rows.len(), 3);
        let sum: f64 = rows.iter().map(|r| r.percent).sum();
        assert!((99.0..=101.0).contains(&sum), "sum was {sum}");

        let open_row = rows.iter().find(|r| r.account_id == ids[0]).unwrap();
        assert_eq!(open_row.weight, 0);
        assert_eq!(open_row.percent, 0.0);
    }

    #[tokio::test]
    async fn open_accounts_are_never_selected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ids) = pool_with(2, &dir).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        breaker.manual_trip(&ids[0]);
        let selector = Selector::new(store, breaker);

        for _ in 0..20 {
            let picked = selector.select(&HashSet::new()).await.unwrap();
            assert_eq!(picked.account_id, ids[1]);
        }
    }

    #[tokio::test]
    async fn exclusion_forces_the_other_account() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ids) = pool_with(2, &dir).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        let selector = Selector::new(store, breaker);

        let mut exclude = HashSet::new();
        exclude.insert(ids[0].clone());
        for _ in 0..10 {
            let picked = selector.select(&exclude).await.unwrap();
            assert_eq!(picked.account_id, ids[1]);
        }
    }

    #[tokio::test]
    async fn exhausted_pool_is_no_accounts_available() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ids) = pool_with(1, &dir).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        let selector = Selector::new(store, breaker);

        let mut exclude = HashSet::new();
        exclude.insert(ids[0].clone());
        let err = selector.select(&exclude).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountsAvailable));
    }

    #[tokio::test]
    async fn empty_pool_is_no_accounts_available() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(AccountStore::load(dir.path().join("kiro-accounts.json")).unwrap());
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        let selector = Selector::new(store, breaker);
        let err = selector.select(&HashSet::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountsAvailable));
    }

    #[tokio::test]
    async fn last_selected_tracks_most_recent_pick() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ids) = pool_with(1, &dir).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(ErrorStats::new())));
        let selector = Selector::new(store, breaker);

        assert!(selector.last_selected().is_none());
        selector.select(&HashSet::new()).await.unwrap();
        assert_eq!(selector.last_selected().unwrap().account_id, ids[0]);
    }
}
