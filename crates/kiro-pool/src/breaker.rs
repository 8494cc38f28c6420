//! Per-account circuit breaker.
//!
//! Three states: Closed (normal), Open (dropping all calls), HalfOpen
//! (probing at reduced weight after the cooldown). The auto-trip decision
//! reads state, evaluates the trip predicate, and writes the new state
//! under a single entry-lock acquisition so concurrent requests cannot race
//! the transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use kiro_core::config::{
    COOLDOWN_SECS, ERROR_RATE_THRESHOLD, FAILURE_THRESHOLD, HALF_OPEN_SUCCESSES, MIN_SAMPLES,
};

use crate::stats::ErrorStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<u64>,
    opened_at: Option<u64>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    entries: RwLock<HashMap<String, Arc<Mutex<BreakerEntry>>>>,
    stats: Arc<ErrorStats>,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitBreaker {
    pub fn new(stats: Arc<ErrorStats>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ErrorStats> {
        &self.stats
    }

    /// Current state, promoting Open → HalfOpen once the cooldown elapses.
    pub fn state(&self, account_id: &str) -> CircuitState {
        self.state_at(account_id, now_epoch())
    }

    /// Record a successful call: resets the failure streak; in HalfOpen,
    /// enough consecutive successes close the circuit.
    pub fn on_success(&self, account_id: &str) {
        self.on_success_at(account_id, now_epoch());
    }

    /// Record a failed call. The caller decides separately whether to
    /// evaluate the trip predicate (`try_auto_trip`).
    pub fn on_failure(&self, account_id: &str) {
        self.on_failure_at(account_id, now_epoch());
    }

    /// Atomically evaluate the trip predicate and open the circuit if it
    /// holds. Returns true when this call performed the transition.
    pub fn try_auto_trip(&self, account_id: &str) -> bool {
        self.try_auto_trip_at(account_id, now_epoch())
    }

    /// Force the circuit open (admin action).
    pub fn manual_trip(&self, account_id: &str) {
        let entry = self.entry(account_id);
        let mut e = lock(&entry);
        e.state = CircuitState::Open;
        e.opened_at = Some(now_epoch());
        e.consecutive_successes = 0;
        info!(account_id, "circuit manually tripped");
    }

    /// Force the circuit closed. Bucket history is cleared *before* the
    /// transition so a residual high error rate cannot immediately re-trip.
    pub fn manual_reset(&self, account_id: &str) {
        let entry = self.entry(account_id);
        let mut e = lock(&entry);
        self.stats.clear(account_id);
        *e = BreakerEntry::default();
        info!(account_id, "circuit manually reset");
    }

    fn state_at(&self, account_id: &str, now: u64) -> CircuitState {
        let Some(entry) = self.entry_if_present(account_id) else {
            return CircuitState::Closed;
        };
        let mut e = lock(&entry);
        if e.state == CircuitState::Open {
            let cooled = e
                .opened_at
                .is_some_and(|opened| now.saturating_sub(opened) >= COOLDOWN_SECS);
            if cooled {
                e.state = CircuitState::HalfOpen;
                e.consecutive_successes = 0;
                info!(account_id, "circuit half-open after cooldown");
            }
        }
        e.state
    }

    fn on_success_at(&self, account_id: &str, now: u64) {
        // promote Open → HalfOpen first so a success right after cooldown counts
        let state = self.state_at(account_id, now);
        self.stats.record(account_id, true);

        let entry = self.entry(account_id);
        let mut e = lock(&entry);
        e.consecutive_failures = 0;
        if state == CircuitState::HalfOpen {
            e.consecutive_successes += 1;
            if e.consecutive_successes >= HALF_OPEN_SUCCESSES {
                e.state = CircuitState::Closed;
                e.opened_at = None;
                e.consecutive_successes = 0;
                info!(account_id, "circuit closed after successful probes");
            }
        }
    }

    fn on_failure_at(&self, account_id: &str, now: u64) {
        let state = self.state_at(account_id, now);
        self.stats.record(account_id, false);

        let entry = self.entry(account_id);
        let mut e = lock(&entry);
        e.consecutive_failures += 1;
        e.consecutive_successes = 0;
        e.last_failure_at = Some(now);
        if state == CircuitState::HalfOpen {
            // a probe failure re-opens and restarts the cooldown
            e.state = CircuitState::Open;
            e.opened_at = Some(now);
            warn!(account_id, "half-open probe failed; circuit re-opened");
        }
    }

    fn try_auto_trip_at(&self, account_id: &str, now: u64) -> bool {
        let entry = self.entry(account_id);
        let mut e = lock(&entry);

        if e.state == CircuitState::Open {
            return false;
        }

        let streak_tripped = e.consecutive_failures >= FAILURE_THRESHOLD;
        let rate_tripped = {
            let (rate, total) = self.stats.error_rate(account_id, 1);
            total >= MIN_SAMPLES && rate >= ERROR_RATE_THRESHOLD
        };

        if streak_tripped || rate_tripped {
            e.state = CircuitState::Open;
            e.opened_at = Some(now);
            e.consecutive_successes = 0;
            warn!(
                account_id,
                streak = e.consecutive_failures,
                by_rate = rate_tripped,
                "circuit tripped"
            );
            true
        } else {
            false
        }
    }

    fn entry(&self, account_id: &str) -> Arc<Mutex<BreakerEntry>> {
        if let Some(entry) = self.entry_if_present(account_id) {
            return entry;
        }
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::default())))
            .clone()
    }

    fn entry_if_present(&self, account_id: &str) -> Option<Arc<Mutex<BreakerEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(ErrorStats::new()))
    }

    #[test]
    fn unknown_account_is_closed() {
        assert_eq!(breaker().state("a"), CircuitState::Closed);
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let b = breaker();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.on_failure_at("a", T0);
            assert!(!b.try_auto_trip_at("a", T0));
        }
        b.on_failure_at("a", T0);
        assert!(b.try_auto_trip_at("a", T0));
        assert_eq!(b.state_at("a", T0), CircuitState::Open);
        // already open — a second evaluation performs no transition
        assert!(!b.try_auto_trip_at("a", T0));
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.on_failure_at("a", T0);
        }
        b.on_success_at("a", T0);
        b.on_failure_at("a", T0);
        assert!(!b.try_auto_trip_at("a", T0));
        assert_eq!(b.state_at("a", T0), CircuitState::Closed);
    }

    #[test]
    fn trips_on_error_rate_with_enough_samples() {
        let b = breaker();
        // 5 successes, 5 failures → rate 0.5, total 10; streak stays below 5
        for _ in 0..5 {
            b.on_success_at("a", T0);
        }
        for _ in 0..4 {
            b.on_failure_at("a", T0);
        }
        b.on_success_at("a", T0);
        b.on_failure_at("a", T0);
        // consecutive failures = 1, but 1-minute rate is 5/11 < 0.5: no trip
        assert!(!b.try_auto_trip_at("a", T0));

        b.on_failure_at("a", T0);
        // now 6 failures / 12 total = 0.5 with total >= 10
        assert!(b.try_auto_trip_at("a", T0));
    }

    #[test]
    fn rate_alone_needs_minimum_samples() {
        let b = breaker();
        // 100% failure rate but only 3 samples, streak below threshold
        for _ in 0..3 {
            b.on_failure_at("a", T0);
        }
        assert!(!b.try_auto_trip_at("a", T0));
    }

    #[test]
    fn cooldown_promotes_to_half_open() {
        let b = breaker();
        b.manual_trip("a");
        assert_eq!(b.state_at("a", T0), CircuitState::Open);
        // manual_trip stamped wall-clock time; re-stamp for determinism
        {
            let entry = b.entry("a");
            lock(&entry).opened_at = Some(T0);
        }
        assert_eq!(b.state_at("a", T0 + COOLDOWN_SECS - 1), CircuitState::Open);
        assert_eq!(b.state_at("a", T0 + COOLDOWN_SECS), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_confirm_successes() {
        let b = breaker();
        b.manual_trip("a");
        {
            let entry = b.entry("a");
            lock(&entry).opened_at = Some(T0);
        }
        let t = T0 + COOLDOWN_SECS;
        assert_eq!(b.state_at("a", t), CircuitState::HalfOpen);

        b.on_success_at("a", t);
        assert_eq!(b.state_at("a", t), CircuitState::HalfOpen);
        b.on_success_at("a", t);
        assert_eq!(b.state_at("a", t), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_cooldown() {
        let b = breaker();
        b.manual_trip("a");
        {
            let entry = b.entry("a");
            lock(&entry).opened_at = Some(T0);
        }
        let t = T0 + COOLDOWN_SECS;
        assert_eq!(b.state_at("a", t), CircuitState::HalfOpen);

        b.on_failure_at("a", t);
        assert_eq!(b.state_at("a", t), CircuitState::Open);
        // cooldown restarted from t, not from the original trip
        assert_eq!(b.state_at("a", t + COOLDOWN_SECS - 1), CircuitState::Open);
        assert_eq!(b.state_at("a", t + COOLDOWN_SECS), CircuitState::HalfOpen);
    }

    #[test]
    fn manual_reset_clears_history_before_closing() {
        let stats = Arc::new(ErrorStats::new());
        let b = CircuitBreaker::new(Arc::clone(&stats));
        for _ in 0..20 {
            b.on_failure_at("a", T0);
        }
        assert!(b.try_auto_trip_at("a", T0));

        b.manual_reset("a");
        assert_eq!(b.state_at("a", T0), CircuitState::Closed);
        // residual history must be gone, or the next request would re-trip
        assert_eq!(stats.error_rate("a", 1), (0.0, 0));
        assert!(!b.try_auto_trip_at("a", T0));
    }
}
