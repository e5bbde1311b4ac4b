//! Request-level defenses that run in front of the session endpoints.

pub mod cors;
pub mod csrf;
pub mod rate_limit;

pub use rate_limit::{RateLimiter, RateSpec};
