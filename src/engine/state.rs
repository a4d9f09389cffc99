//! Algorithm-specific mutable quota state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::rules::{Algorithm, RateLimitRule};

/// One counted slot of a sliding window. Increments within the same second
/// are coalesced into a single entry to bound memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub timestamp_ms: u64,
    pub count: u64,
}

/// One queued item of a leaky bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub timestamp_ms: u64,
    pub request_id: String,
}

/// Per-key mutable state, one variant per algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RateLimitState {
    TokenBucket {
        /// Available tokens, `0..=capacity`
        tokens: f64,
        capacity: f64,
        /// Tokens added per second
        refill_rate: f64,
        last_refill_ms: u64,
    },
    SlidingWindow {
        /// Sorted ascending by timestamp, all within `[now - window, now]`
        entries: VecDeque<WindowEntry>,
    },
    FixedWindow {
        count: u64,
        /// Advances in exact window-length jumps
        window_start_ms: u64,
    },
    LeakyBucket {
        /// Length never exceeds the rule limit
        queue: VecDeque<QueueEntry>,
        /// Items drained per second
        leak_rate: f64,
        last_leak_ms: u64,
    },
}

impl RateLimitState {
    /// Zero state for a rule: token buckets start full at `burst ?? limit`,
    /// collections start empty, fixed windows open at `now`.
    pub fn for_rule(rule: &RateLimitRule, now_ms: u64) -> Self {
        match rule.algorithm {
            Algorithm::TokenBucket => RateLimitState::TokenBucket {
                tokens: rule.capacity() as f64,
                capacity: rule.capacity() as f64,
                refill_rate: rule.rate_per_sec(),
                last_refill_ms: now_ms,
            },
            Algorithm::SlidingWindow => RateLimitState::SlidingWindow {
                entries: VecDeque::new(),
            },
            Algorithm::FixedWindow => RateLimitState::FixedWindow {
                count: 0,
                window_start_ms: now_ms,
            },
            Algorithm::LeakyBucket => RateLimitState::LeakyBucket {
                queue: VecDeque::new(),
                leak_rate: rule.rate_per_sec(),
                last_leak_ms: now_ms,
            },
        }
    }

    /// Whether this variant belongs to the given algorithm. A mismatch means
    /// the rule's algorithm changed after the state was created, and the
    /// state must be re-initialized.
    pub fn matches_algorithm(&self, algorithm: Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (RateLimitState::TokenBucket { .. }, Algorithm::TokenBucket)
                | (RateLimitState::SlidingWindow { .. }, Algorithm::SlidingWindow)
                | (RateLimitState::FixedWindow { .. }, Algorithm::FixedWindow)
                | (RateLimitState::LeakyBucket { .. }, Algorithm::LeakyBucket)
        )
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleActions, Scope};

    fn rule(algorithm: Algorithm) -> RateLimitRule {
        RateLimitRule {
            id: "r1".to_string(),
            name: "r1".to_string(),
            algorithm,
            scope: Scope::Global,
            limit: 10,
            window_ms: 2_000,
            burst: Some(25),
            refill_rate: None,
            priority: 1,
            enabled: true,
            conditions: None,
            actions: RuleActions::default(),
        }
    }

    #[test]
    fn test_token_bucket_starts_full_at_burst() {
        let state = RateLimitState::for_rule(&rule(Algorithm::TokenBucket), 0);
        match state {
            RateLimitState::TokenBucket { tokens, capacity, refill_rate, .. } => {
                assert_eq!(tokens, 25.0);
                assert_eq!(capacity, 25.0);
                // 10 per 2s window
                assert!((refill_rate - 5.0).abs() < 1e-9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_variant_matches_algorithm() {
        let state = RateLimitState::for_rule(&rule(Algorithm::SlidingWindow), 0);
        assert!(state.matches_algorithm(Algorithm::SlidingWindow));
        assert!(!state.matches_algorithm(Algorithm::TokenBucket));
    }

    #[test]
    fn test_fixed_window_opens_at_creation_time() {
        let state = RateLimitState::for_rule(&rule(Algorithm::FixedWindow), 4_200);
        match state {
            RateLimitState::FixedWindow { count, window_start_ms } => {
                assert_eq!(count, 0);
                assert_eq!(window_start_ms, 4_200);
            }
            _ => panic!("wrong variant"),
        }
    }
}
