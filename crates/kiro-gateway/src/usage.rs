//! Global usage accounting.
//!
//! Per-request samples go onto an mpsc queue; a single drainer task
//! aggregates them and flushes `token-stats.json` every 10 seconds, so the
//! request hot path never touches the disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiro_core::store as disk;

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const QUEUE_DEPTH: usize = 1024;

/// One completed request's token accounting.
#[derive(Debug, Clone, Default)]
pub struct UsageSample {
    pub account_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl UsageTotals {
    fn add(&mut self, sample: &UsageSample) {
        self.requests += 1;
        self.input_tokens += sample.input_tokens;
        self.output_tokens += sample.output_tokens;
        self.cache_read_tokens += sample.cache_read_tokens;
        self.cache_write_tokens += sample.cache_write_tokens;
    }
}

/// Persisted shape of `token-stats.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    pub totals: UsageTotals,
    #[serde(default)]
    pub by_model: BTreeMap<String, UsageTotals>,
    #[serde(default)]
    pub by_account: BTreeMap<String, UsageTotals>,
}

/// Producer handle shared with request tasks.
#[derive(Clone)]
pub struct UsageCounters {
    tx: mpsc::Sender<UsageSample>,
}

impl UsageCounters {
    /// Enqueue a sample. Dropping one under backpressure is preferable to
    /// stalling a response stream.
    pub fn record(&self, sample: UsageSample) {
        if self.tx.try_send(sample).is_err() {
            warn!("usage queue full; sample dropped");
        }
    }
}

/// Spawn the drainer task and return the producer handle.
pub fn start_usage_drainer(path: String, shutdown: CancellationToken) -> UsageCounters {
    let (tx, mut rx) = mpsc::channel::<UsageSample>(QUEUE_DEPTH);

    tokio::spawn(async move {
        let mut stats: TokenStats = if std::path::Path::new(&path).exists() {
            disk::read_json(&path).unwrap_or_default()
        } else {
            TokenStats::default()
        };
        let mut dirty = false;
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                sample = rx.recv() => {
                    match sample {
                        Some(sample) => {
                            stats.totals.add(&sample);
                            stats.by_model.entry(sample.model.clone()).or_default().add(&sample);
                            stats.by_account.entry(sample.account_id.clone()).or_default().add(&sample);
                            dirty = true;
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if dirty {
                        flush(&path, &stats);
                        dirty = false;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // drain what's left and write a final snapshot
        while let Ok(sample) = rx.try_recv() {
            stats.totals.add(&sample);
            stats.by_model.entry(sample.model.clone()).or_default().add(&sample);
            stats.by_account.entry(sample.account_id.clone()).or_default().add(&sample);
            dirty = true;
        }
        if dirty {
            flush(&path, &stats);
        }
        debug!("usage drainer stopped");
    });

    UsageCounters { tx }
}

fn flush(path: &str, stats: &TokenStats) {
    if let Err(e) = disk::write_json_atomic(path, stats) {
        warn!(error = %e, "failed to persist token stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(model: &str, input: u64, output: u64) -> UsageSample {
        UsageSample {
            account_id: "acct-1".into(),
            model: model.into(),
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }

    #[test]
    fn totals_accumulate() {
        let mut stats = TokenStats::default();
        stats.totals.add(&sample("m1", 10, 5));
        stats.totals.add(&sample("m1", 3, 2));
        assert_eq!(stats.totals.requests, 2);
        assert_eq!(stats.totals.input_tokens, 13);
        assert_eq!(stats.totals.output_tokens, 7);
    }

    #[tokio::test]
    async fn drainer_persists_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("token-stats.json")
            .to_string_lossy()
            .into_owned();
        let shutdown = CancellationToken::new();
        let counters = start_usage_drainer(path.clone(), shutdown.clone());

        counters.record(sample("claude-sonnet-4.5", 20, 8));
        counters.record(sample("claude-sonnet-4.5", 5, 2));
        // give the drainer a tick to consume the queue
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats: TokenStats = disk::read_json(&path).unwrap();
        assert_eq!(stats.totals.requests, 2);
        assert_eq!(stats.totals.input_tokens, 25);
        assert_eq!(stats.by_model["claude-sonnet-4.5"].output_tokens, 10);
        assert_eq!(stats.by_account["acct-1"].requests, 2);
    }
}
