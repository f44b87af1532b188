//! Per-client fixed-window admission control.

mod key;
mod limiter;
mod limits;
mod middleware;
mod store;

pub use key::RateLimitKey;
pub use limiter::{Admission, RateLimiter};
pub use limits::{AuthLimiters, LimitConfig, RateLimitsConfig};
pub use middleware::{client_identifier, enforce, protect, RateLimitState, RateLimitedBody};
pub use store::{spawn_sweeper, CounterStore, Hit, MemoryCounterStore, RateLimitEntry};
