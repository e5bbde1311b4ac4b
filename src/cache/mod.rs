//! Revocation and staleness caches.
//!
//! The volatile store is an accelerator, never the source of truth. Reads report
//! [`Lookup::Unavailable`] instead of an error so every caller decides, at the call
//! site, whether a dependency outage lets the request through.

mod authz;
pub mod memory;
mod single_flight;

pub use authz::{
    AuthzCache, RevocationStatus, StalenessPolicy, DEFAULT_EPOCH_TTL_SECONDS,
    DEFAULT_PERMSET_TTL_SECONDS, REVOCATION_MARGIN_SECONDS,
};
pub use memory::MemoryStore;
pub use single_flight::SingleFlight;

use std::{future::Future, pin::Pin, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("volatile store unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected value stored under {0}")]
    Corrupt(String),
}

pub type VolatileFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Fast key/value store with per-key expiry.
pub trait VolatileStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> VolatileFuture<'a, Option<String>>;

    /// `ttl = None` keeps the entry until overwritten.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> VolatileFuture<'a, ()>;

    /// Returns `true` when the value was stored.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> VolatileFuture<'a, bool>;

    /// Increment a counter. The TTL is applied only when the counter is created.
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> VolatileFuture<'a, u64>;

    fn delete<'a>(&'a self, key: &'a str) -> VolatileFuture<'a, ()>;

    fn ping(&self) -> VolatileFuture<'_, ()>;
}

/// Result of a best-effort cache read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    /// The backing store could not answer.
    Unavailable,
}

#[must_use]
pub fn epoch_key(tenant_id: &str, user_id: &str) -> String {
    format!("ev:{tenant_id}:{user_id}")
}

#[must_use]
pub fn permset_key(tenant_id: &str, user_id: &str) -> String {
    format!("permset:{tenant_id}:{user_id}")
}

#[must_use]
pub fn blocklist_key(jti: &str) -> String {
    format!("jti:block:{jti}")
}
