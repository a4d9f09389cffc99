//! Per-key quota state storage.

use dashmap::DashMap;
use tracing::{debug, trace};

use super::algorithms::{self, AlgorithmOutcome};
use super::key::StateKey;
use super::state::RateLimitState;
use crate::rules::RateLimitRule;

/// One stored state plus its activity watermark for eviction.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub state: RateLimitState,
    pub last_activity_ms: u64,
}

impl StateEntry {
    /// Eviction predicate. `window_ms` is the owning rule's current window,
    /// or `None` when the rule was removed and the state is orphaned.
    fn is_evictable(&self, now_ms: u64, retention_ms: u64, window_ms: Option<u64>) -> bool {
        let window_ms = match window_ms {
            Some(w) => w,
            // Orphaned by rule removal; no decision references it anymore.
            None => return true,
        };

        if now_ms.saturating_sub(self.last_activity_ms) >= retention_ms {
            return true;
        }

        match &self.state {
            // A bucket's token count stays meaningful while idle; only the
            // retention bound applies.
            RateLimitState::TokenBucket { .. } => false,
            // No entries left inside the window: the next check would start
            // from scratch anyway.
            RateLimitState::SlidingWindow { entries } => entries
                .back()
                .map_or(true, |e| e.timestamp_ms + window_ms < now_ms),
            // Far past its boundary with nothing counted.
            RateLimitState::FixedWindow { count, window_start_ms } => {
                *count == 0 && now_ms.saturating_sub(*window_start_ms) >= window_ms
            }
            // Empty queue and a stale leak watermark.
            RateLimitState::LeakyBucket { queue, last_leak_ms, .. } => {
                queue.is_empty() && now_ms.saturating_sub(*last_leak_ms) >= window_ms
            }
        }
    }
}

/// Maps composite keys to algorithm state.
///
/// State is created lazily on first use and owned exclusively by this store.
/// `check` holds the map entry lock for the whole read-modify-write, so two
/// concurrent requests can never both observe the same free capacity. The
/// cleanup sweep runs through `retain`, which takes the same shard locks as
/// in-flight checks.
#[derive(Default)]
pub struct KeyStateStore {
    entries: DashMap<StateKey, StateEntry>,
}

impl KeyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the rule's algorithm against the keyed state, initializing zero
    /// state on first use.
    pub fn check(
        &self,
        rule: &RateLimitRule,
        key: StateKey,
        now_ms: u64,
        request_id: &str,
    ) -> AlgorithmOutcome {
        trace!(key = %key, "Checking quota state");

        let mut entry = self.entries.entry(key).or_insert_with(|| {
            debug!(
                rule = %rule.id,
                algorithm = rule.algorithm.as_str(),
                "Creating quota state"
            );
            StateEntry {
                state: RateLimitState::for_rule(rule, now_ms),
                last_activity_ms: now_ms,
            }
        });

        // The rule's algorithm may have changed since this state was created;
        // a stale variant is re-initialized rather than misread.
        if !entry.state.matches_algorithm(rule.algorithm) {
            entry.state = RateLimitState::for_rule(rule, now_ms);
        }

        entry.last_activity_ms = now_ms;
        algorithms::apply(rule, &mut entry.state, now_ms, request_id)
    }

    /// Snapshot of the state for a key, if any.
    pub fn get(&self, key: &StateKey) -> Option<RateLimitState> {
        self.entries.get(key).map(|e| e.state.clone())
    }

    pub fn remove(&self, key: &StateKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict entries idle beyond the retention window, entries whose state
    /// holds no live data, and entries orphaned by rule removal.
    ///
    /// `rule_window` resolves a rule id to its current window, `None` for a
    /// removed rule. Returns the number of evicted entries.
    pub fn evict_idle<F>(&self, now_ms: u64, retention_ms: u64, rule_window: F) -> usize
    where
        F: Fn(&str) -> Option<u64>,
    {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            !entry.is_evictable(now_ms, retention_ms, rule_window(&key.rule_id))
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted idle quota state");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
