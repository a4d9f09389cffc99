//! The admission decision engine.
//!
//! Ties the classifier, the state store, and the stats collector together:
//! matched rules are evaluated in priority order, the first non-admitting
//! result short-circuits, and otherwise the most restrictive allowed result
//! wins. The check path is synchronous and never returns an error for a
//! well-formed request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use super::algorithms::AlgorithmOutcome;
use super::key::StateKey;
use super::store::KeyStateStore;
use crate::config::{EngineConfig, RuleSet};
use crate::error::Result;
use crate::request::{DecisionMetadata, RateLimitResult, Request};
use crate::rules::{RateLimitRule, RequestClassifier, RuleRegistry, RuleUpdate};
use crate::stats::{DecisionRecord, StatsCollector};

/// The core rate limiter.
///
/// Explicitly constructed and injectable: the registry, store, and stats
/// collector are shared by reference, so a configuration surface or the
/// cleanup scheduler can hold the same instances. Thread-safe; decisions may
/// run concurrently from any number of workers.
pub struct RateLimiter {
    registry: Arc<RuleRegistry>,
    store: Arc<KeyStateStore>,
    stats: Arc<StatsCollector>,
    classifier: RequestClassifier,
}

impl RateLimiter {
    /// Create an engine with fresh component instances.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(RuleRegistry::new()),
            Arc::new(KeyStateStore::new()),
            Arc::new(StatsCollector::new(config.history_cap)),
        )
    }

    /// Create an engine over externally owned components.
    pub fn with_parts(
        config: &EngineConfig,
        registry: Arc<RuleRegistry>,
        store: Arc<KeyStateStore>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            registry,
            store,
            stats,
            classifier: RequestClassifier::new(config.condition_policy),
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<KeyStateStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Register a rule and initialize its stats bucket.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        let id = rule.id.clone();
        self.registry.add_rule(rule)?;
        self.stats.register_rule(&id);
        Ok(())
    }

    /// Merge a partial update into a live rule, effective for the next check.
    pub fn update_rule(&self, id: &str, update: &RuleUpdate) -> Result<()> {
        self.registry.update_rule(id, update)
    }

    /// Remove a rule and its stats bucket. Associated per-key state is
    /// orphaned and collected by the next cleanup sweep.
    pub fn remove_rule(&self, id: &str) -> Result<RateLimitRule> {
        let removed = self.registry.remove_rule(id)?;
        self.stats.unregister_rule(id);
        Ok(removed)
    }

    /// Register a seed rule set, e.g. one loaded from YAML at startup.
    pub fn load_rules(&self, set: RuleSet) -> Result<()> {
        for rule in set.rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    /// Decide whether to admit a request.
    ///
    /// Matched rules are evaluated ascending by priority. The first result
    /// whose action does not admit the request becomes the final decision;
    /// if every rule admits, the minimum-remaining result wins. No matching
    /// rule means a default allow with unbounded remaining quota.
    pub fn check(&self, request: &Request) -> RateLimitResult {
        let started = Instant::now();
        let now_ms = request.timestamp_ms;

        trace!(request = %request.id, endpoint = %request.endpoint, "Checking request");
        let classification = self.classifier.classify(&self.registry, request);

        if let Some(rule) = classification.forced_deny {
            // Fail-closed policy: deny without touching quota state.
            let key = StateKey::new(&rule, request);
            let outcome = AlgorithmOutcome {
                allowed: false,
                current_usage: rule.limit,
                reset_at_ms: now_ms + rule.window_ms,
                retry_after_secs: Some(rule.window_ms.div_ceil(1000)),
            };
            let result = Self::build_result(&rule, &key, &outcome);
            self.record(request, &result, started);
            return result;
        }

        let mut most_restrictive: Option<RateLimitResult> = None;

        for rule in classification.matched {
            let key = StateKey::new(&rule, request);
            let outcome = self.store.check(&rule, key.clone(), now_ms, &request.id);
            let result = Self::build_result(&rule, &key, &outcome);

            if !result.allowed {
                debug!(
                    rule = %rule.id,
                    key = %key,
                    action = result.action.as_str(),
                    "Rate limit exceeded"
                );
                self.record(request, &result, started);
                return result;
            }

            let tighter = most_restrictive
                .as_ref()
                .map_or(true, |best| result.remaining < best.remaining);
            if tighter {
                most_restrictive = Some(result);
            }
        }

        let result =
            most_restrictive.unwrap_or_else(|| RateLimitResult::default_allow(now_ms));
        self.record(request, &result, started);
        result
    }

    fn build_result(
        rule: &RateLimitRule,
        key: &StateKey,
        outcome: &AlgorithmOutcome,
    ) -> RateLimitResult {
        let exceeded = !outcome.allowed;
        let action = if exceeded {
            rule.actions.on_exceed
        } else {
            rule.actions.on_limit
        };
        let remaining = rule.limit.saturating_sub(outcome.current_usage);

        let mut headers = HashMap::new();
        headers.insert("X-RateLimit-Limit".to_string(), rule.limit.to_string());
        headers.insert("X-RateLimit-Remaining".to_string(), remaining.to_string());
        headers.insert(
            "X-RateLimit-Reset".to_string(),
            (outcome.reset_at_ms / 1000).to_string(),
        );
        headers.insert(
            "X-RateLimit-Algorithm".to_string(),
            rule.algorithm.as_str().to_string(),
        );
        if let Some(retry) = outcome.retry_after_secs {
            headers.insert("Retry-After".to_string(), retry.to_string());
        }

        let (status, message) = if exceeded {
            if let Some(custom) = &rule.actions.headers {
                for (name, value) in custom {
                    headers.insert(name.clone(), value.clone());
                }
            }
            (rule.actions.status, rule.actions.message.clone())
        } else {
            (None, None)
        };

        RateLimitResult {
            allowed: action.admits(),
            action,
            remaining,
            reset_at_ms: outcome.reset_at_ms,
            retry_after_secs: outcome.retry_after_secs,
            headers,
            matched_rule: Some(rule.id.clone()),
            status,
            message,
            metadata: Some(DecisionMetadata {
                algorithm: rule.algorithm,
                scope: rule.scope,
                key: key.to_string(),
                current_usage: outcome.current_usage,
                limit: rule.limit,
                window_ms: rule.window_ms,
            }),
        }
    }

    fn record(&self, request: &Request, result: &RateLimitResult, started: Instant) {
        let consumer = request
            .user_id
            .clone()
            .or_else(|| request.api_key.clone())
            .unwrap_or_else(|| request.ip_address.clone());

        self.stats.record(DecisionRecord {
            timestamp_ms: request.timestamp_ms,
            consumer,
            endpoint: request.endpoint.clone(),
            rule_id: result.matched_rule.clone(),
            action: result.action,
            latency_us: started.elapsed().as_micros() as u64,
        });
    }
}
