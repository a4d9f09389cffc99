//! Rule storage and lifecycle.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use super::rule::{RateLimitRule, RuleUpdate};
use crate::error::{FloodgateError, Result};

/// Stores rate limit rule definitions.
///
/// The registry is an explicitly constructed service, shared by reference
/// between the classifier, the engine, and any configuration surface. All
/// reads clone out of the lock so no guard escapes this module.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, RateLimitRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a rule.
    ///
    /// The rule shape is validated first; an invalid rule is never stored.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;

        debug!(
            rule = %rule.id,
            algorithm = rule.algorithm.as_str(),
            scope = rule.scope.as_str(),
            limit = rule.limit,
            window_ms = rule.window_ms,
            "Registering rate limit rule"
        );

        let mut rules = self.rules.write();
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Merge a partial update into an existing rule.
    ///
    /// The merged rule is re-validated before it replaces the stored one, so
    /// a bad update leaves the previous rule intact. Updates take effect for
    /// the next decision.
    pub fn update_rule(&self, id: &str, update: &RuleUpdate) -> Result<()> {
        let mut rules = self.rules.write();
        let existing = rules
            .get(id)
            .ok_or_else(|| FloodgateError::UnknownRule(id.to_string()))?;

        let mut merged = existing.clone();
        update.apply(&mut merged);
        merged.validate()?;

        debug!(rule = %id, "Updating rate limit rule");
        rules.insert(id.to_string(), merged);
        Ok(())
    }

    /// Remove a rule, returning it.
    ///
    /// Any per-key state associated with the rule is orphaned; the cleanup
    /// sweep collects it once idle.
    pub fn remove_rule(&self, id: &str) -> Result<RateLimitRule> {
        let mut rules = self.rules.write();
        let removed = rules
            .remove(id)
            .ok_or_else(|| FloodgateError::UnknownRule(id.to_string()))?;
        info!(rule = %id, "Removed rate limit rule");
        Ok(removed)
    }

    pub fn get_rule(&self, id: &str) -> Option<RateLimitRule> {
        self.rules.read().get(id).cloned()
    }

    /// All rules, sorted ascending by priority (then id, for stable output).
    pub fn list_rules(&self) -> Vec<RateLimitRule> {
        let rules = self.rules.read();
        let mut all: Vec<RateLimitRule> = rules.values().cloned().collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
