//! Composite state key generation.

use crate::request::Request;
use crate::rules::{RateLimitRule, Scope};

/// A key that uniquely identifies the quota state for one rule and one
/// scope-derived identity.
///
/// The discriminator is `global`, `user:<id>`, `ip:<addr>`, `api_key:<key>`,
/// or `endpoint:<path>:<method>` depending on the rule scope. When a scoped
/// identity is missing from the request (no user id, no API key), the client
/// IP stands in so the rule still applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// The rule this state belongs to
    pub rule_id: String,
    /// Scope-derived identity
    pub discriminator: String,
}

impl StateKey {
    /// Derive the key for a rule and request.
    pub fn new(rule: &RateLimitRule, request: &Request) -> Self {
        let discriminator = match rule.scope {
            Scope::Global => "global".to_string(),
            Scope::User => format!(
                "user:{}",
                request.user_id.as_deref().unwrap_or(&request.ip_address)
            ),
            Scope::Ip => format!("ip:{}", request.ip_address),
            Scope::ApiKey => format!(
                "api_key:{}",
                request.api_key.as_deref().unwrap_or(&request.ip_address)
            ),
            Scope::Endpoint => format!("endpoint:{}:{}", request.endpoint, request.method),
        };

        Self {
            rule_id: rule.id.clone(),
            discriminator,
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.discriminator)
    }
}
