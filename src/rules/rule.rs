//! Rate limit rule model.
//!
//! Rules are mutable configuration objects owned by the [`RuleRegistry`].
//! They are declared at startup from a seed set (see [`crate::config::RuleSet`])
//! or registered at runtime, and may be updated in place.
//!
//! [`RuleRegistry`]: crate::rules::RuleRegistry

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FloodgateError, Result};

/// Quota enforcement algorithm for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

impl Algorithm {
    /// Wire name, used in the `X-RateLimit-Algorithm` response header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

/// Identity dimension a quota is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    User,
    Ip,
    ApiKey,
    Endpoint,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::ApiKey => "api_key",
            Scope::Endpoint => "endpoint",
        }
    }
}

/// Action taken for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    Allow,
    Deny,
    Throttle,
    Queue,
}

impl LimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitAction::Allow => "allow",
            LimitAction::Deny => "deny",
            LimitAction::Throttle => "throttle",
            LimitAction::Queue => "queue",
        }
    }

    /// Whether this action admits the request to the downstream pipeline.
    pub fn admits(&self) -> bool {
        matches!(self, LimitAction::Allow)
    }
}

/// A `[start, end]` time-of-day range in local time, `"HH:MM"` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDayRange {
    pub start: String,
    pub end: String,
}

/// Optional match conditions restricting which requests a rule applies to.
///
/// Every present condition must match; an absent condition matches anything.
/// A rule with no conditions matches unconditionally within its scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Role allow-list
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    /// Endpoint path prefixes
    #[serde(default)]
    pub endpoints: Option<Vec<String>>,
    /// Exact HTTP methods
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// IP address prefixes. This is a simplified prefix check, not
    /// CIDR-correct matching - a documented limitation.
    #[serde(default)]
    pub ip_ranges: Option<Vec<String>>,
    /// Local time-of-day ranges; at least one must contain the request time.
    #[serde(default)]
    pub time_windows: Option<Vec<TimeOfDayRange>>,
}

impl RuleConditions {
    /// True when no condition is present at all.
    pub fn is_empty(&self) -> bool {
        self.roles.is_none()
            && self.endpoints.is_none()
            && self.methods.is_none()
            && self.ip_ranges.is_none()
            && self.time_windows.is_none()
    }
}

/// What to do when a rule admits or exhausts its quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    /// Action while within quota.
    #[serde(default = "default_on_limit")]
    pub on_limit: LimitAction,
    /// Action once the quota is exceeded.
    #[serde(default = "default_on_exceed")]
    pub on_exceed: LimitAction,
    /// Custom HTTP status to respond with when the quota is exceeded.
    #[serde(default)]
    pub status: Option<u16>,
    /// Custom message to respond with when the quota is exceeded.
    #[serde(default)]
    pub message: Option<String>,
    /// Extra response headers attached to the decision.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

fn default_on_limit() -> LimitAction {
    LimitAction::Allow
}

fn default_on_exceed() -> LimitAction {
    LimitAction::Deny
}

impl Default for RuleActions {
    fn default() -> Self {
        Self {
            on_limit: default_on_limit(),
            on_exceed: default_on_exceed(),
            status: None,
            message: None,
            headers: None,
        }
    }
}

/// A rate limit rule specifying the quota, algorithm, scope, and actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Unique rule identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Quota enforcement algorithm
    pub algorithm: Algorithm,
    /// Identity dimension the quota is keyed on
    pub scope: Scope,
    /// Maximum admitted units per window (must be > 0)
    pub limit: u64,
    /// Quota window in milliseconds (must be > 0)
    pub window_ms: u64,
    /// Token bucket capacity override (defaults to `limit`)
    #[serde(default)]
    pub burst: Option<u64>,
    /// Refill rate in tokens per second (token bucket) or leak rate in
    /// items per second (leaky bucket). Defaults to `limit / window`.
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Evaluation order among simultaneously matching rules; lower first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
    #[serde(default)]
    pub actions: RuleActions,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Validate the rule shape.
    ///
    /// Rejects non-positive limits, windows, bursts, and refill rates.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FloodgateError::Validation("rule id must not be empty".into()));
        }
        if self.limit == 0 {
            return Err(FloodgateError::Validation(format!(
                "rule {}: limit must be greater than zero",
                self.id
            )));
        }
        if self.window_ms == 0 {
            return Err(FloodgateError::Validation(format!(
                "rule {}: window must be greater than zero",
                self.id
            )));
        }
        if let Some(burst) = self.burst {
            if burst == 0 {
                return Err(FloodgateError::Validation(format!(
                    "rule {}: burst must be greater than zero",
                    self.id
                )));
            }
        }
        if let Some(rate) = self.refill_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(FloodgateError::Validation(format!(
                    "rule {}: refill_rate must be a positive number",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Token bucket capacity: `burst` if set, otherwise `limit`.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Refill/leak rate in units per second: `refill_rate` if set,
    /// otherwise `limit / window`.
    pub fn rate_per_sec(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.limit as f64 / (self.window_ms as f64 / 1000.0))
    }
}

/// A partial rule used to merge updates into an existing rule.
///
/// Only present fields are applied; the merged rule is re-validated before it
/// replaces the stored one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
    #[serde(default)]
    pub actions: Option<RuleActions>,
}

impl RuleUpdate {
    /// Apply the present fields onto `rule`.
    pub fn apply(&self, rule: &mut RateLimitRule) {
        if let Some(ref name) = self.name {
            rule.name = name.clone();
        }
        if let Some(algorithm) = self.algorithm {
            rule.algorithm = algorithm;
        }
        if let Some(scope) = self.scope {
            rule.scope = scope;
        }
        if let Some(limit) = self.limit {
            rule.limit = limit;
        }
        if let Some(window_ms) = self.window_ms {
            rule.window_ms = window_ms;
        }
        if let Some(burst) = self.burst {
            rule.burst = Some(burst);
        }
        if let Some(rate) = self.refill_rate {
            rule.refill_rate = Some(rate);
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(ref conditions) = self.conditions {
            rule.conditions = Some(conditions.clone());
        }
        if let Some(ref actions) = self.actions {
            rule.actions = actions.clone();
        }
    }
}
