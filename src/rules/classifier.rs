//! Request classification against the rule set.

use chrono::{Local, NaiveTime, TimeZone, Timelike};
use tracing::{debug, trace};

use super::registry::RuleRegistry;
use super::rule::{RateLimitRule, RuleConditions, TimeOfDayRange};
use crate::config::ConditionPolicy;
use crate::request::Request;

/// How a single rule's conditions relate to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionMatch {
    Match,
    NoMatch,
    /// Condition data could not be interpreted (unparsable time range,
    /// empty IP prefix). Resolution depends on the configured policy.
    Malformed,
}

/// The classified rule list for one request.
#[derive(Debug, Default)]
pub struct Classification {
    /// Matching enabled rules, ascending by priority.
    pub matched: Vec<RateLimitRule>,
    /// Under [`ConditionPolicy::FailClosed`], the first rule whose malformed
    /// condition forces an outright denial.
    pub forced_deny: Option<RateLimitRule>,
}

/// Selects the rules that apply to a request.
pub struct RequestClassifier {
    policy: ConditionPolicy,
}

impl RequestClassifier {
    pub fn new(policy: ConditionPolicy) -> Self {
        Self { policy }
    }

    /// Return all enabled rules whose conditions match, in priority order.
    pub fn classify(&self, registry: &RuleRegistry, request: &Request) -> Classification {
        let mut classification = Classification::default();

        for rule in registry.list_rules() {
            if !rule.enabled {
                continue;
            }

            match Self::conditions_match(&rule, request) {
                ConditionMatch::Match => {
                    trace!(rule = %rule.id, request = %request.id, "Rule matched");
                    classification.matched.push(rule);
                }
                ConditionMatch::NoMatch => {}
                ConditionMatch::Malformed => match self.policy {
                    ConditionPolicy::FailOpen => {
                        debug!(
                            rule = %rule.id,
                            "Malformed rule condition, skipping rule (fail-open)"
                        );
                    }
                    ConditionPolicy::FailClosed => {
                        debug!(
                            rule = %rule.id,
                            "Malformed rule condition, denying request (fail-closed)"
                        );
                        classification.forced_deny = Some(rule);
                        break;
                    }
                },
            }
        }

        classification
    }

    fn conditions_match(rule: &RateLimitRule, request: &Request) -> ConditionMatch {
        let conditions = match &rule.conditions {
            // No conditions: the rule matches unconditionally within its scope.
            None => return ConditionMatch::Match,
            Some(c) if c.is_empty() => return ConditionMatch::Match,
            Some(c) => c,
        };

        let checks = [
            Self::role_matches(conditions, request),
            Self::endpoint_matches(conditions, request),
            Self::method_matches(conditions, request),
            Self::ip_matches(conditions, request),
            Self::time_of_day_matches(conditions, request),
        ];

        if checks.contains(&ConditionMatch::Malformed) {
            ConditionMatch::Malformed
        } else if checks.contains(&ConditionMatch::NoMatch) {
            ConditionMatch::NoMatch
        } else {
            ConditionMatch::Match
        }
    }

    fn role_matches(conditions: &RuleConditions, request: &Request) -> ConditionMatch {
        match &conditions.roles {
            None => ConditionMatch::Match,
            Some(roles) => match &request.role {
                Some(role) if roles.iter().any(|r| r == role) => ConditionMatch::Match,
                _ => ConditionMatch::NoMatch,
            },
        }
    }

    fn endpoint_matches(conditions: &RuleConditions, request: &Request) -> ConditionMatch {
        match &conditions.endpoints {
            None => ConditionMatch::Match,
            Some(prefixes) => {
                if prefixes.iter().any(|p| request.endpoint.starts_with(p)) {
                    ConditionMatch::Match
                } else {
                    ConditionMatch::NoMatch
                }
            }
        }
    }

    fn method_matches(conditions: &RuleConditions, request: &Request) -> ConditionMatch {
        match &conditions.methods {
            None => ConditionMatch::Match,
            Some(methods) => {
                if methods.iter().any(|m| m.eq_ignore_ascii_case(&request.method)) {
                    ConditionMatch::Match
                } else {
                    ConditionMatch::NoMatch
                }
            }
        }
    }

    /// Simplified prefix match against the configured ranges. A range like
    /// `10.0.0.0/8` is reduced to the text before the slash; this is not
    /// CIDR-correct matching and is documented as a known limitation.
    fn ip_matches(conditions: &RuleConditions, request: &Request) -> ConditionMatch {
        match &conditions.ip_ranges {
            None => ConditionMatch::Match,
            Some(ranges) => {
                let mut matched = false;
                for range in ranges {
                    let prefix = range.split('/').next().unwrap_or("");
                    if prefix.is_empty() {
                        return ConditionMatch::Malformed;
                    }
                    if request.ip_address.starts_with(prefix) {
                        matched = true;
                    }
                }
                if matched {
                    ConditionMatch::Match
                } else {
                    ConditionMatch::NoMatch
                }
            }
        }
    }

    /// The request's local time-of-day must fall within at least one range.
    /// Ranges where `start > end` wrap past midnight.
    fn time_of_day_matches(conditions: &RuleConditions, request: &Request) -> ConditionMatch {
        let windows = match &conditions.time_windows {
            None => return ConditionMatch::Match,
            Some(w) => w,
        };

        let local = match Local.timestamp_millis_opt(request.timestamp_ms as i64).single() {
            Some(dt) => dt.time(),
            None => return ConditionMatch::Malformed,
        };
        // Ranges are minute-granular, so the request time is compared at
        // minute precision; an inclusive 23:59 end covers the whole minute.
        let local =
            NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or(local);

        let mut matched = false;
        for window in windows {
            match Self::parse_range(window) {
                Some((start, end)) => {
                    let contained = if start <= end {
                        local >= start && local <= end
                    } else {
                        local >= start || local <= end
                    };
                    if contained {
                        matched = true;
                    }
                }
                None => return ConditionMatch::Malformed,
            }
        }

        if matched {
            ConditionMatch::Match
        } else {
            ConditionMatch::NoMatch
        }
    }

    fn parse_range(range: &TimeOfDayRange) -> Option<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&range.start, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(&range.end, "%H:%M").ok()?;
        Some((start, end))
    }
}
