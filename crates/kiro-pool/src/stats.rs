//! Sliding-window error-rate statistic.
//!
//! Outcomes land in 10-second buckets aligned to 10-second boundaries; five
//! minutes of history is kept per account. Locking is two-tier: a
//! reader-writer lock around the account map (with double-checked
//! insertion) and a per-account mutex around the bucket list, so the hot
//! path of concurrent requests takes only the outer read lock plus the
//! entry mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use kiro_core::config::{BUCKET_RETENTION_SECS, BUCKET_WIDTH_SECS, MAX_BUCKETS};

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start: u64,
    successes: u64,
    failures: u64,
}

type BucketList = VecDeque<Bucket>;

#[derive(Default)]
pub struct ErrorStats {
    accounts: RwLock<HashMap<String, Arc<Mutex<BucketList>>>>,
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

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request outcome for an account.
    pub fn record(&self, account_id: &str, success: bool) {
        self.record_at(account_id, success, now_epoch());
    }

    /// Error rate and sample count over the trailing window.
    /// `window_minutes` is 1 or 5; empty history yields `(0.0, 0)`.
    pub fn error_rate(&self, account_id: &str, window_minutes: u32) -> (f64, u64) {
        self.error_rate_at(account_id, window_minutes, now_epoch())
    }

    /// Drop all history for an account (manual breaker reset).
    pub fn clear(&self, account_id: &str) {
        if let Some(entry) = self.entry_if_present(account_id) {
            lock(&entry).clear();
        }
    }

    fn record_at(&self, account_id: &str, success: bool, now: u64) {
        let entry = self.entry(account_id);
        let mut buckets = lock(&entry);

        let start = now - now % BUCKET_WIDTH_SECS;
        match buckets.back_mut() {
            Some(tail) if tail.start == start => {
                if success {
                    tail.successes += 1;
                } else {
                    tail.failures += 1;
                }
            }
            _ => {
                let mut bucket = Bucket {
                    start,
                    ..Default::default()
                };
                if success {
                    bucket.successes += 1;
                } else {
                    bucket.failures += 1;
                }
                buckets.push_back(bucket);
            }
        }

        // evict expired history from the head
        while let Some(head) = buckets.front() {
            let expired = head.start + BUCKET_WIDTH_SECS <= now.saturating_sub(BUCKET_RETENTION_SECS);
            if expired || buckets.len() > MAX_BUCKETS {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate_at(&self, account_id: &str, window_minutes: u32, now: u64) -> (f64, u64) {
        let Some(entry) = self.entry_if_present(account_id) else {
            return (0.0, 0);
        };
        let buckets = lock(&entry);

        let window_start = now.saturating_sub(window_minutes as u64 * 60);
        let (mut successes, mut failures) = (0u64, 0u64);
        for bucket in buckets.iter() {
            // count buckets whose [start, start+10) intersects [window_start, now]
            if bucket.start + BUCKET_WIDTH_SECS > window_start && bucket.start <= now {
                successes += bucket.successes;
                failures += bucket.failures;
            }
        }

        let total = successes + failures;
        if total == 0 {
            (0.0, 0)
        } else {
            (failures as f64 / total as f64, total)
        }
    }

    fn entry(&self, account_id: &str) -> Arc<Mutex<BucketList>> {
        if let Some(entry) = self.entry_if_present(account_id) {
            return entry;
        }
        // double-checked: re-probe under the write lock before inserting
        let mut map = self
            .accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BucketList::new())))
            .clone()
    }

    fn entry_if_present(&self, account_id: &str) -> Option<Arc<Mutex<BucketList>>> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account_id)
            .cloned()
    }

    #[cfg(test)]
    fn bucket_count(&self, account_id: &str) -> usize {
        self.entry_if_present(account_id)
            .map(|e| lock(&e).len())
            .unwrap_or(0)
    }
}
