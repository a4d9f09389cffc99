//! Rule definitions, storage, and request classification.

mod classifier;
mod registry;
mod rule;

pub use classifier::{Classification, RequestClassifier};
pub use registry::RuleRegistry;
pub use rule::{
    Algorithm, LimitAction, RateLimitRule, RuleActions, RuleConditions, RuleUpdate, Scope,
    TimeOfDayRange,
};
