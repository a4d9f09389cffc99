//! Admission decision logic and quota state management.

mod algorithms;
mod key;
mod limiter;
mod state;
mod store;

pub use algorithms::AlgorithmOutcome;
pub use key::StateKey;
pub use limiter::RateLimiter;
pub use state::{QueueEntry, RateLimitState, WindowEntry};
pub use store::KeyStateStore;
