//! Configuration management for the Floodgate engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::rules::RateLimitRule;

/// Policy for rules carrying malformed condition data (unparsable time
/// range, empty IP prefix).
///
/// Whether such rules should be skipped or should block the request is
/// deliberately configurable rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPolicy {
    /// The malformed condition is treated as non-matching and the rule is
    /// skipped for that request.
    FailOpen,
    /// The request is denied outright with the rule's exceed action.
    FailClosed,
}

impl Default for ConditionPolicy {
    fn default() -> Self {
        ConditionPolicy::FailOpen
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long idle per-key state and history entries are retained, in
    /// milliseconds.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Interval between cleanup sweeps, in milliseconds.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Maximum number of request history entries kept for statistics;
    /// oldest entries are evicted first.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// How malformed rule conditions are resolved.
    #[serde(default)]
    pub condition_policy: ConditionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            history_cap: default_history_cap(),
            condition_policy: ConditionPolicy::default(),
        }
    }
}

fn default_retention_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_history_cap() -> usize {
    10_000
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse engine config: {}", e)))
    }
}

/// A seed set of rules loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rule set");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule set from a YAML string. Every rule is shape-validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rule set: {}", e)))?;
        for rule in &set.rules {
            rule.validate()?;
        }
        Ok(set)
    }
}
