//! Session endpoints and their supporting modules.
//!
//! ## Client Modes
//!
//! Browsers (`web`) receive the session as three cookies and must prove same-site intent
//! on state-changing calls (allow-listed Origin plus the `X-CSRF` double-submit header).
//! Native clients (`mobile`) receive a JSON token pair and send bearer tokens, which no
//! third-party page can attach, so CSRF checks do not apply to them.
//!
//! ## Refresh Rotation
//!
//! Every refresh retires the presented secret and issues a new one. A secret that was
//! already rotated, revoked or expired fails with the same `UNAUTHENTICATED` answer.

pub(crate) mod cookies;
pub mod exchange;
mod issue;
pub mod logout;
pub mod refresh;
mod state;
pub mod switch;
pub(crate) mod types;
pub(crate) mod utils;

pub use state::{
    AuthConfig, AuthState, Backends, DEFAULT_API_BASE_PATH, DEFAULT_RATE_LIMIT_IP,
    DEFAULT_RATE_LIMIT_USER, DEFAULT_REFRESH_TTL_SECONDS, DEFAULT_UPSTREAM_PROVIDER,
    IDEMPOTENCY_TTL_SECONDS,
};

#[cfg(test)]
pub(crate) mod test_support;
