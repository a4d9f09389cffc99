//! Decision statistics: rolling counters, hourly series, top-N breakdowns.
//!
//! Aggregates are maintained incrementally per decision rather than rescanned
//! from history on every read. The bounded history exists to age the top-N
//! breakdowns: when an entry falls out (cap or retention), its contribution
//! is subtracted, so consumer and endpoint volumes always describe the
//! retained window. Lifetime totals are monotonic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::rules::LimitAction;

const HOUR_MS: u64 = 60 * 60 * 1000;
const HOURLY_BUCKETS: usize = 24;
const TOP_N: usize = 10;

/// One decision, as reported by the engine.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub timestamp_ms: u64,
    /// Requesting identity: user id, API key, or client IP, in that order.
    pub consumer: String,
    pub endpoint: String,
    pub rule_id: Option<String>,
    pub action: LimitAction,
    pub latency_us: u64,
}

/// Per-rule trigger counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuleStats {
    pub matched: u64,
    pub allowed: u64,
    pub denied: u64,
    pub throttled: u64,
    pub queued: u64,
}

/// One hour of the time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start_ms: u64,
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
}

/// A top-N breakdown row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub key: String,
    pub requests: u64,
}

/// The aggregate snapshot consumed by a stats/dashboard surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub throttled: u64,
    pub queued: u64,
    /// Rolling average decision latency in microseconds.
    pub avg_latency_us: u64,
    pub rules: HashMap<String, RuleStats>,
    /// Top 10 consumers by request volume over the retained history.
    pub top_consumers: Vec<VolumeEntry>,
    /// Top 10 endpoints by request volume over the retained history.
    pub top_endpoints: Vec<VolumeEntry>,
    /// Up to 24 hourly buckets, oldest first.
    pub hourly: Vec<HourlyBucket>,
    pub history_len: usize,
}

struct HistoryEntry {
    timestamp_ms: u64,
    consumer: String,
    endpoint: String,
}

#[derive(Default)]
struct StatsInner {
    total: u64,
    allowed: u64,
    denied: u64,
    throttled: u64,
    queued: u64,
    latency_total_us: u64,
    rules: HashMap<String, RuleStats>,
    consumers: HashMap<String, u64>,
    endpoints: HashMap<String, u64>,
    hourly: VecDeque<HourlyBucket>,
    history: VecDeque<HistoryEntry>,
}

impl StatsInner {
    /// Subtract one evicted history entry from the windowed breakdowns.
    fn forget(&mut self, entry: &HistoryEntry) {
        if let Some(count) = self.consumers.get_mut(&entry.consumer) {
            *count -= 1;
            if *count == 0 {
                self.consumers.remove(&entry.consumer);
            }
        }
        if let Some(count) = self.endpoints.get_mut(&entry.endpoint) {
            *count -= 1;
            if *count == 0 {
                self.endpoints.remove(&entry.endpoint);
            }
        }
    }
}

/// Collects decision statistics behind a single short-lived lock.
pub struct StatsCollector {
    history_cap: usize,
    inner: Mutex<StatsInner>,
}

impl StatsCollector {
    pub fn new(history_cap: usize) -> Self {
        Self {
            history_cap,
            inner: Mutex::new(StatsInner::default()),
        }
    }

    /// Initialize the stats bucket for a newly registered rule.
    pub fn register_rule(&self, rule_id: &str) {
        let mut inner = self.inner.lock();
        inner.rules.entry(rule_id.to_string()).or_default();
    }

    /// Drop the stats bucket for a removed rule.
    pub fn unregister_rule(&self, rule_id: &str) {
        let mut inner = self.inner.lock();
        inner.rules.remove(rule_id);
    }

    /// Record one decision. O(1); called on every check.
    pub fn record(&self, record: DecisionRecord) {
        let mut inner = self.inner.lock();

        inner.total += 1;
        inner.latency_total_us += record.latency_us;
        match record.action {
            LimitAction::Allow => inner.allowed += 1,
            LimitAction::Deny => inner.denied += 1,
            LimitAction::Throttle => inner.throttled += 1,
            LimitAction::Queue => inner.queued += 1,
        }

        if let Some(ref rule_id) = record.rule_id {
            let rule = inner.rules.entry(rule_id.clone()).or_default();
            rule.matched += 1;
            match record.action {
                LimitAction::Allow => rule.allowed += 1,
                LimitAction::Deny => rule.denied += 1,
                LimitAction::Throttle => rule.throttled += 1,
                LimitAction::Queue => rule.queued += 1,
            }
        }

        *inner.consumers.entry(record.consumer.clone()).or_default() += 1;
        *inner.endpoints.entry(record.endpoint.clone()).or_default() += 1;

        let hour_start_ms = record.timestamp_ms / HOUR_MS * HOUR_MS;
        let admitted = record.action.admits();
        let same_hour = inner
            .hourly
            .back()
            .is_some_and(|b| b.hour_start_ms == hour_start_ms);
        if same_hour {
            if let Some(bucket) = inner.hourly.back_mut() {
                bucket.total += 1;
                if admitted {
                    bucket.allowed += 1;
                } else {
                    bucket.denied += 1;
                }
            }
        } else {
            inner.hourly.push_back(HourlyBucket {
                hour_start_ms,
                total: 1,
                allowed: u64::from(admitted),
                denied: u64::from(!admitted),
            });
            while inner.hourly.len() > HOURLY_BUCKETS {
                inner.hourly.pop_front();
            }
        }

        inner.history.push_back(HistoryEntry {
            timestamp_ms: record.timestamp_ms,
            consumer: record.consumer,
            endpoint: record.endpoint,
        });
        while inner.history.len() > self.history_cap {
            if let Some(evicted) = inner.history.pop_front() {
                inner.forget(&evicted);
            }
        }
    }

    /// Drop history entries (and their breakdown contributions) older than
    /// `cutoff_ms`, plus hourly buckets that ended before it. Returns the
    /// number of history entries dropped.
    pub fn trim_history(&self, cutoff_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut trimmed = 0;

        while inner
            .history
            .front()
            .is_some_and(|e| e.timestamp_ms < cutoff_ms)
        {
            if let Some(evicted) = inner.history.pop_front() {
                inner.forget(&evicted);
                trimmed += 1;
            }
        }

        while inner
            .hourly
            .front()
            .is_some_and(|b| b.hour_start_ms + HOUR_MS <= cutoff_ms)
        {
            inner.hourly.pop_front();
        }

        trimmed
    }

    /// Aggregate snapshot. Pure read: recomputes only the sorted top-N views
    /// from the maintained counters, never the history.
    pub fn snapshot(&self) -> RateLimitStats {
        let inner = self.inner.lock();

        let avg_latency_us = if inner.total > 0 {
            inner.latency_total_us / inner.total
        } else {
            0
        };

        RateLimitStats {
            total_requests: inner.total,
            allowed: inner.allowed,
            denied: inner.denied,
            throttled: inner.throttled,
            queued: inner.queued,
            avg_latency_us,
            rules: inner.rules.clone(),
            top_consumers: top_n(&inner.consumers),
            top_endpoints: top_n(&inner.endpoints),
            hourly: inner.hourly.iter().copied().collect(),
            history_len: inner.history.len(),
        }
    }
}

fn top_n(volumes: &HashMap<String, u64>) -> Vec<VolumeEntry> {
    let mut entries: Vec<VolumeEntry> = volumes
        .iter()
        .map(|(key, requests)| VolumeEntry {
            key: key.clone(),
            requests: *requests,
        })
        .collect();
    // Ties break on the key for a stable ordering
    entries.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(TOP_N);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(consumer: &str, endpoint: &str, action: LimitAction, ts: u64) -> DecisionRecord {
        DecisionRecord {
            timestamp_ms: ts,
            consumer: consumer.to_string(),
            endpoint: endpoint.to_string(),
            rule_id: Some("r1".to_string()),
            action,
            latency_us: 40,
        }
    }

    #[test]
    fn test_counters_by_action() {
        let stats = StatsCollector::new(100);
        stats.record(record("a", "/x", LimitAction::Allow, 0));
        stats.record(record("a", "/x", LimitAction::Allow, 0));
        stats.record(record("b", "/y", LimitAction::Deny, 0));
        stats.record(record("b", "/y", LimitAction::Throttle, 0));
        stats.record(record("c", "/z", LimitAction::Queue, 0));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.allowed, 2);
        assert_eq!(snapshot.denied, 1);
        assert_eq!(snapshot.throttled, 1);
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.avg_latency_us, 40);
    }

    #[test]
    fn test_per_rule_counters() {
        let stats = StatsCollector::new(100);
        stats.register_rule("r1");
        stats.record(record("a", "/x", LimitAction::Allow, 0));
        stats.record(record("a", "/x", LimitAction::Deny, 0));

        let snapshot = stats.snapshot();
        let rule = &snapshot.rules["r1"];
        assert_eq!(rule.matched, 2);
        assert_eq!(rule.allowed, 1);
        assert_eq!(rule.denied, 1);
    }

    #[test]
    fn test_registered_rule_has_empty_bucket() {
        let stats = StatsCollector::new(100);
        stats.register_rule("fresh");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rules["fresh"].matched, 0);

        stats.unregister_rule("fresh");
        assert!(!stats.snapshot().rules.contains_key("fresh"));
    }

    #[test]
    fn test_top_consumers_ordering() {
        let stats = StatsCollector::new(100);
        for _ in 0..3 {
            stats.record(record("heavy", "/x", LimitAction::Allow, 0));
        }
        stats.record(record("light", "/x", LimitAction::Allow, 0));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.top_consumers[0].key, "heavy");
        assert_eq!(snapshot.top_consumers[0].requests, 3);
        assert_eq!(snapshot.top_consumers[1].key, "light");
    }

    #[test]
    fn test_top_n_is_capped_at_ten() {
        let stats = StatsCollector::new(1_000);
        for i in 0..15 {
            stats.record(record(&format!("c{i}"), "/x", LimitAction::Allow, 0));
        }
        assert_eq!(stats.snapshot().top_consumers.len(), 10);
    }

    #[test]
    fn test_history_cap_ages_out_breakdowns() {
        let stats = StatsCollector::new(2);
        stats.record(record("old", "/old", LimitAction::Allow, 0));
        stats.record(record("new", "/new", LimitAction::Allow, 1));
        stats.record(record("new", "/new", LimitAction::Allow, 2));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.history_len, 2);
        // "old" fell out of the bounded history
        assert!(snapshot.top_consumers.iter().all(|e| e.key != "old"));
        // Lifetime totals stay monotonic
        assert_eq!(snapshot.total_requests, 3);
    }

    #[test]
    fn test_trim_history_by_retention() {
        let stats = StatsCollector::new(1_000);
        stats.record(record("a", "/x", LimitAction::Allow, 1_000));
        stats.record(record("b", "/y", LimitAction::Allow, 5_000_000));

        let trimmed = stats.trim_history(4_000_000);
        assert_eq!(trimmed, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.history_len, 1);
        assert_eq!(snapshot.top_consumers.len(), 1);
        assert_eq!(snapshot.top_consumers[0].key, "b");
    }

    #[test]
    fn test_hourly_series_buckets_and_cap() {
        let stats = StatsCollector::new(100_000);
        // Two in hour 0, one denied in hour 1
        stats.record(record("a", "/x", LimitAction::Allow, 10));
        stats.record(record("a", "/x", LimitAction::Allow, 20));
        stats.record(record("a", "/x", LimitAction::Deny, HOUR_MS + 1));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hourly.len(), 2);
        assert_eq!(snapshot.hourly[0].total, 2);
        assert_eq!(snapshot.hourly[0].allowed, 2);
        assert_eq!(snapshot.hourly[1].denied, 1);

        // A day and a half of traffic keeps only 24 buckets
        for hour in 2..40 {
            stats.record(record("a", "/x", LimitAction::Allow, hour * HOUR_MS));
        }
        assert_eq!(stats.snapshot().hourly.len(), 24);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let stats = StatsCollector::new(100);
        stats.record(record("a", "/x", LimitAction::Allow, 0));

        let first = stats.snapshot();
        let second = stats.snapshot();
        assert_eq!(first.total_requests, second.total_requests);
        assert_eq!(first.top_consumers, second.top_consumers);
        assert_eq!(first.hourly, second.hourly);
    }
}
