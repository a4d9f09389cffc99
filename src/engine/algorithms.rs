//! Quota state transitions, one pure function per algorithm.
//!
//! Each function consumes a `(rule, state, now)` triple, mutates the state
//! in place, and reports whether the unit of work was admitted. Time flows
//! in through `now_ms` only, so every transition is deterministic and
//! directly testable without sleeping.

use std::collections::VecDeque;

use super::state::{QueueEntry, RateLimitState, WindowEntry};
use crate::rules::RateLimitRule;

/// Result of a single state transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgorithmOutcome {
    /// Whether the quota admitted this unit.
    pub allowed: bool,
    /// Units of quota in use after the transition, clamped to the rule limit.
    pub current_usage: u64,
    /// Unix milliseconds at which the quota next frees a unit or resets.
    pub reset_at_ms: u64,
    /// Whole seconds to wait before retrying; set on denial only.
    pub retry_after_secs: Option<u64>,
}

/// Apply the rule's algorithm to its state.
///
/// The caller guarantees the state variant matches the rule algorithm (the
/// store re-initializes on mismatch), so each arm binds its own variant.
pub fn apply(
    rule: &RateLimitRule,
    state: &mut RateLimitState,
    now_ms: u64,
    request_id: &str,
) -> AlgorithmOutcome {
    match state {
        RateLimitState::TokenBucket {
            tokens,
            capacity,
            refill_rate,
            last_refill_ms,
        } => token_bucket(rule, tokens, *capacity, *refill_rate, last_refill_ms, now_ms),
        RateLimitState::SlidingWindow { entries } => sliding_window(rule, entries, now_ms),
        RateLimitState::FixedWindow {
            count,
            window_start_ms,
        } => fixed_window(rule, count, window_start_ms, now_ms),
        RateLimitState::LeakyBucket {
            queue,
            leak_rate,
            last_leak_ms,
        } => leaky_bucket(rule, queue, *leak_rate, last_leak_ms, now_ms, request_id),
    }
}

/// Token bucket: continuous refill proportional to elapsed time, capped at
/// capacity; each admitted unit consumes one token.
fn token_bucket(
    rule: &RateLimitRule,
    tokens: &mut f64,
    capacity: f64,
    refill_rate: f64,
    last_refill_ms: &mut u64,
    now_ms: u64,
) -> AlgorithmOutcome {
    let elapsed_secs = now_ms.saturating_sub(*last_refill_ms) as f64 / 1000.0;
    *tokens = (*tokens + elapsed_secs * refill_rate).min(capacity);
    *last_refill_ms = now_ms;

    let allowed = *tokens >= 1.0;
    if allowed {
        *tokens -= 1.0;
    }

    // remaining = limit - usage, so usage mirrors whole tokens left; a
    // burst capacity above the limit clamps usage to zero.
    let current_usage = rule.limit.saturating_sub(tokens.floor() as u64);

    let reset_at_ms = if *tokens >= 1.0 {
        now_ms
    } else {
        now_ms + secs_to_ms((1.0 - *tokens) / refill_rate)
    };

    let retry_after_secs =
        (!allowed).then(|| ((1.0 - *tokens) / refill_rate).ceil().max(0.0) as u64);

    AlgorithmOutcome {
        allowed,
        current_usage,
        reset_at_ms,
        retry_after_secs,
    }
}

/// Sliding window: counts within a continuously moving interval ending now.
fn sliding_window(
    rule: &RateLimitRule,
    entries: &mut VecDeque<WindowEntry>,
    now_ms: u64,
) -> AlgorithmOutcome {
    let window_floor = now_ms.saturating_sub(rule.window_ms);
    while entries
        .front()
        .is_some_and(|e| e.timestamp_ms < window_floor)
    {
        entries.pop_front();
    }

    let in_window: u64 = entries.iter().map(|e| e.count).sum();
    let allowed = in_window < rule.limit;

    let current_usage = if allowed {
        // Coalesce increments landing in the same second into one entry.
        let same_second = entries
            .back()
            .is_some_and(|back| back.timestamp_ms / 1000 == now_ms / 1000);
        if same_second {
            if let Some(back) = entries.back_mut() {
                back.count += 1;
            }
        } else {
            entries.push_back(WindowEntry {
                timestamp_ms: now_ms,
                count: 1,
            });
        }
        in_window + 1
    } else {
        in_window
    };

    let reset_at_ms = entries
        .front()
        .map(|e| e.timestamp_ms + rule.window_ms)
        .unwrap_or(now_ms + rule.window_ms);

    let retry_after_secs = (!allowed).then(|| ms_to_secs_ceil(reset_at_ms.saturating_sub(now_ms)));

    AlgorithmOutcome {
        allowed,
        current_usage: current_usage.min(rule.limit),
        reset_at_ms,
        retry_after_secs,
    }
}

/// Fixed window: discrete intervals with deterministic boundaries; the
/// window start only ever advances in exact window-length jumps.
fn fixed_window(
    rule: &RateLimitRule,
    count: &mut u64,
    window_start_ms: &mut u64,
    now_ms: u64,
) -> AlgorithmOutcome {
    let elapsed = now_ms.saturating_sub(*window_start_ms);
    if elapsed >= rule.window_ms {
        let periods = elapsed / rule.window_ms;
        *window_start_ms += periods * rule.window_ms;
        *count = 0;
    }

    let allowed = *count < rule.limit;
    if allowed {
        *count += 1;
    }

    let reset_at_ms = *window_start_ms + rule.window_ms;
    let retry_after_secs = (!allowed).then(|| ms_to_secs_ceil(reset_at_ms.saturating_sub(now_ms)));

    AlgorithmOutcome {
        allowed,
        current_usage: *count,
        reset_at_ms,
        retry_after_secs,
    }
}

/// Leaky bucket: a queue draining at a constant rate; admission depends on
/// occupancy, not instantaneous burst.
fn leaky_bucket(
    rule: &RateLimitRule,
    queue: &mut VecDeque<QueueEntry>,
    leak_rate: f64,
    last_leak_ms: &mut u64,
    now_ms: u64,
    request_id: &str,
) -> AlgorithmOutcome {
    let elapsed_secs = now_ms.saturating_sub(*last_leak_ms) as f64 / 1000.0;
    let leaked = (elapsed_secs * leak_rate).floor() as u64;

    if leaked > 0 {
        let drained = (leaked as usize).min(queue.len());
        for _ in 0..drained {
            queue.pop_front();
        }
        if queue.is_empty() {
            *last_leak_ms = now_ms;
        } else {
            // Advance only by whole drained units, keeping fractional
            // progress toward the next leak.
            *last_leak_ms += secs_to_ms(leaked as f64 / leak_rate);
        }
    }

    let allowed = (queue.len() as u64) < rule.limit;
    if allowed {
        queue.push_back(QueueEntry {
            timestamp_ms: now_ms,
            request_id: request_id.to_string(),
        });
    }

    let occupancy = queue.len() as u64;
    let reset_at_ms = now_ms + secs_to_ms(occupancy as f64 / leak_rate);
    let retry_after_secs = (!allowed).then(|| (occupancy as f64 / leak_rate).ceil() as u64);

    AlgorithmOutcome {
        allowed,
        current_usage: occupancy.min(rule.limit),
        reset_at_ms,
        retry_after_secs,
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).ceil().max(0.0) as u64
}

fn ms_to_secs_ceil(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Algorithm, RuleActions, Scope};

    fn rule(algorithm: Algorithm, limit: u64, window_ms: u64) -> RateLimitRule {
        RateLimitRule {
            id: "r1".to_string(),
            name: "r1".to_string(),
            algorithm,
            scope: Scope::Global,
            limit,
            window_ms,
            burst: None,
            refill_rate: None,
            priority: 1,
            enabled: true,
            conditions: None,
            actions: RuleActions::default(),
        }
    }

    fn check(rule: &RateLimitRule, state: &mut RateLimitState, now_ms: u64) -> AlgorithmOutcome {
        apply(rule, state, now_ms, "req")
    }

    #[test]
    fn test_token_bucket_burst_then_refill() {
        // capacity=5, refill 1 token/sec
        let mut rule = rule(Algorithm::TokenBucket, 5, 1_000);
        rule.refill_rate = Some(1.0);
        let mut state = RateLimitState::for_rule(&rule, 0);

        // 5 instant requests drain the bucket, remaining 4,3,2,1,0
        for expected_usage in 1..=5 {
            let outcome = check(&rule, &mut state, 0);
            assert!(outcome.allowed);
            assert_eq!(outcome.current_usage, expected_usage);
        }

        // 6th is denied with retry_after about one second
        let denied = check(&rule, &mut state, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.current_usage, 5);
        assert_eq!(denied.retry_after_secs, Some(1));

        // One second later a single token has refilled
        let outcome = check(&rule, &mut state, 1_000);
        assert!(outcome.allowed);
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let mut rule = rule(Algorithm::TokenBucket, 5, 1_000);
        rule.refill_rate = Some(1000.0);
        let mut state = RateLimitState::for_rule(&rule, 0);
        check(&rule, &mut state, 0);

        // A long idle period refills back to capacity, never beyond
        let outcome = check(&rule, &mut state, 3_600_000);
        assert!(outcome.allowed);
        match state {
            RateLimitState::TokenBucket { tokens, capacity, .. } => {
                assert!(tokens <= capacity);
                assert_eq!(tokens, 4.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_token_bucket_refill_proportional_to_elapsed() {
        let mut rule = rule(Algorithm::TokenBucket, 10, 1_000);
        rule.refill_rate = Some(2.0);
        let mut state = RateLimitState::for_rule(&rule, 0);

        // Drain all 10 tokens
        for _ in 0..10 {
            assert!(check(&rule, &mut state, 0).allowed);
        }

        // 2500ms at 2 tokens/sec refills exactly 5; one is consumed
        check(&rule, &mut state, 2_500);
        match state {
            RateLimitState::TokenBucket { tokens, .. } => assert!((tokens - 4.0).abs() < 1e-9),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sliding_window_scenario() {
        // limit=3, window=1000ms
        let rule = rule(Algorithm::SlidingWindow, 3, 1_000);
        let mut state = RateLimitState::for_rule(&rule, 0);

        for (t, expected_usage) in [(0u64, 1u64), (100, 2), (200, 3)] {
            let outcome = check(&rule, &mut state, t);
            assert!(outcome.allowed, "t={t}");
            assert_eq!(outcome.current_usage, expected_usage);
        }

        let denied = check(&rule, &mut state, 500);
        assert!(!denied.allowed);
        assert_eq!(denied.current_usage, 3);
        // Oldest entry at t=0, so the window frees up at t=1000
        assert_eq!(denied.reset_at_ms, 1_000);

        // Old entries have expired by t=1001
        let outcome = check(&rule, &mut state, 1_001);
        assert!(outcome.allowed);
    }

    #[test]
    fn test_sliding_window_coalesces_same_second() {
        let rule = rule(Algorithm::SlidingWindow, 100, 10_000);
        let mut state = RateLimitState::for_rule(&rule, 0);

        for t in [0, 100, 900, 1_200] {
            check(&rule, &mut state, t);
        }

        match &state {
            RateLimitState::SlidingWindow { entries } => {
                // t=0,100,900 share one second-bucket; t=1200 starts another
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].count, 3);
                assert_eq!(entries[1].count, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sliding_window_entries_stay_inside_window() {
        let rule = rule(Algorithm::SlidingWindow, 10, 1_000);
        let mut state = RateLimitState::for_rule(&rule, 0);

        for t in [0, 400, 800, 1_500, 2_600] {
            check(&rule, &mut state, t);
        }

        match &state {
            RateLimitState::SlidingWindow { entries } => {
                for entry in entries {
                    assert!(entry.timestamp_ms >= 2_600 - 1_000);
                }
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fixed_window_scenario() {
        // limit=2, window=1000ms
        let rule = rule(Algorithm::FixedWindow, 2, 1_000);
        let mut state = RateLimitState::for_rule(&rule, 0);

        assert!(check(&rule, &mut state, 0).allowed);
        assert!(check(&rule, &mut state, 50).allowed);

        let denied = check(&rule, &mut state, 900);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_ms, 1_000);
        assert_eq!(denied.retry_after_secs, Some(1));

        // The boundary at exactly windowStart + window opens a new window
        let outcome = check(&rule, &mut state, 1_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.current_usage, 1);
    }

    #[test]
    fn test_fixed_window_never_resets_early() {
        let rule = rule(Algorithm::FixedWindow, 1, 1_000);
        let mut state = RateLimitState::for_rule(&rule, 0);

        assert!(check(&rule, &mut state, 0).allowed);
        assert!(!check(&rule, &mut state, 999).allowed);
        assert!(check(&rule, &mut state, 1_000).allowed);
    }

    #[test]
    fn test_fixed_window_start_advances_in_whole_windows() {
        let rule = rule(Algorithm::FixedWindow, 2, 1_000);
        let mut state = RateLimitState::for_rule(&rule, 0);
        check(&rule, &mut state, 0);

        // Skipping several windows keeps boundaries aligned to t=0
        check(&rule, &mut state, 3_700);
        match state {
            RateLimitState::FixedWindow { window_start_ms, count } => {
                assert_eq!(window_start_ms, 3_000);
                assert_eq!(count, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_leaky_bucket_scenario() {
        // limit=2, leak 1 item/sec
        let mut rule = rule(Algorithm::LeakyBucket, 2, 1_000);
        rule.refill_rate = Some(1.0);
        let mut state = RateLimitState::for_rule(&rule, 0);

        assert!(check(&rule, &mut state, 0).allowed);
        assert!(check(&rule, &mut state, 10).allowed);

        let denied = check(&rule, &mut state, 20);
        assert!(!denied.allowed);
        assert_eq!(denied.current_usage, 2);
        assert_eq!(denied.retry_after_secs, Some(2));

        // By t=1020 one item has leaked, freeing a slot
        let outcome = check(&rule, &mut state, 1_020);
        assert!(outcome.allowed);
        assert_eq!(outcome.current_usage, 2);
    }

    #[test]
    fn test_leaky_bucket_occupancy_never_exceeds_limit() {
        let mut rule = rule(Algorithm::LeakyBucket, 3, 1_000);
        rule.refill_rate = Some(0.5);
        let mut state = RateLimitState::for_rule(&rule, 0);

        for t in 0..20 {
            check(&rule, &mut state, t * 10);
            match &state {
                RateLimitState::LeakyBucket { queue, .. } => assert!(queue.len() <= 3),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_leaky_bucket_drains_at_leak_rate_despite_bursts() {
        // leak 2/sec; a full bucket at t=0 should be empty after 1.5s
        let mut rule = rule(Algorithm::LeakyBucket, 3, 1_000);
        rule.refill_rate = Some(2.0);
        let mut state = RateLimitState::for_rule(&rule, 0);

        for _ in 0..3 {
            check(&rule, &mut state, 0);
        }

        // 700ms: floor(0.7 * 2) = 1 item drained, fractional progress kept
        check(&rule, &mut state, 700);
        match &state {
            RateLimitState::LeakyBucket { queue, last_leak_ms, .. } => {
                // one drained, one admitted
                assert_eq!(queue.len(), 3);
                assert_eq!(*last_leak_ms, 500);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_usage_never_exceeds_limit_across_algorithms() {
        for algorithm in [
            Algorithm::TokenBucket,
            Algorithm::SlidingWindow,
            Algorithm::FixedWindow,
            Algorithm::LeakyBucket,
        ] {
            let rule = rule(algorithm, 4, 1_000);
            let mut state = RateLimitState::for_rule(&rule, 0);
            for i in 0..10 {
                let outcome = check(&rule, &mut state, i);
                assert!(
                    outcome.current_usage <= rule.limit,
                    "{algorithm:?} exceeded limit"
                );
            }
        }
    }
}
