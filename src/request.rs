//! Request and decision types exchanged with the request-handling pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::rules::{Algorithm, LimitAction, Scope};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A normalized inbound request description.
///
/// Ephemeral: consumed by a single decision and never persisted. The
/// `timestamp_ms` field is the decision clock, which keeps the engine
/// deterministic under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub ip_address: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Unix milliseconds at which the request arrived.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Create a request stamped with a fresh id and the current time.
    pub fn new(ip_address: &str, endpoint: &str, method: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            ip_address: ip_address.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            api_key: None,
            role: None,
            timestamp_ms: now_ms(),
            headers: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// Per-decision detail about the rule and state that produced the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub algorithm: Algorithm,
    pub scope: Scope,
    /// Composite state key the decision was made against
    pub key: String,
    pub current_usage: u64,
    pub limit: u64,
    pub window_ms: u64,
}

/// The outcome of an admission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the request may be forwarded downstream.
    pub allowed: bool,
    /// The action the caller should take.
    pub action: LimitAction,
    /// Remaining quota, clamped to `>= 0`. `u64::MAX` for a default allow
    /// with no matching rule.
    pub remaining: u64,
    /// Unix milliseconds at which the quota next resets or frees a unit.
    pub reset_at_ms: u64,
    /// Seconds the caller should wait before retrying, set on denial.
    #[serde(default)]
    pub retry_after_secs: Option<u64>,
    /// `X-RateLimit-*` headers plus any rule-configured custom headers.
    pub headers: HashMap<String, String>,
    /// Id of the rule that produced this result.
    #[serde(default)]
    pub matched_rule: Option<String>,
    /// Custom HTTP status configured on the deciding rule.
    #[serde(default)]
    pub status: Option<u16>,
    /// Custom message configured on the deciding rule.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<DecisionMetadata>,
}

impl RateLimitResult {
    /// The default allow produced when no rule matches a request.
    pub fn default_allow(now_ms: u64) -> Self {
        Self {
            allowed: true,
            action: LimitAction::Allow,
            remaining: u64::MAX,
            reset_at_ms: now_ms,
            retry_after_secs: None,
            headers: HashMap::new(),
            matched_rule: None,
            status: None,
            message: None,
            metadata: None,
        }
    }
}
