//! Durable collaborators: memberships, roles, refresh sessions, and the durable side of
//! the revocation and epoch caches.
//!
//! Each concern is a trait so the guard chain and the session endpoints can run against
//! Postgres in production and against in-memory fakes in tests.

pub mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::PgStore;

use anyhow::{Context, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, future::Future, pin::Pin};
use utoipa::ToSchema;
use uuid::Uuid;

/// Random bytes behind every refresh secret.
pub const REFRESH_SECRET_BYTES: usize = 48;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Clone, Debug, PartialEq)]
pub struct Membership {
    pub tenant_id: String,
    pub user_id: String,
    pub status: String,
    pub roles: Vec<String>,
    pub attrs: Map<String, Value>,
}

impl Membership {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }
}

/// One candidate in the "choose a tenant" response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantChoice {
    pub tenant_id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Rotated,
    Revoked,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

/// An active refresh session as seen by callers. The secret hash never leaves the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshSession {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub expires_at_unix: i64,
}

#[derive(Clone, Debug)]
pub struct NewRefreshSession {
    pub user_id: String,
    pub tenant_id: String,
    pub token_hash: Vec<u8>,
    pub ttl_seconds: i64,
    pub device: Option<Value>,
}

/// Membership lookups for the guard chain and the session endpoints.
pub trait MembershipResolver: Send + Sync {
    fn membership<'a>(
        &'a self,
        tenant_id: &'a str,
        user_id: &'a str,
    ) -> StoreFuture<'a, Option<Membership>>;

    /// Tenants where the user holds an active membership, ordered by tenant id.
    fn active_tenants<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Vec<TenantChoice>>;

    fn tenant_name<'a>(&'a self, tenant_id: &'a str) -> StoreFuture<'a, Option<String>>;
}

pub trait RoleResolver: Send + Sync {
    /// Flattened union of the permissions attached to `roles` in `tenant_id`.
    fn permissions_for_roles<'a>(
        &'a self,
        tenant_id: &'a str,
        roles: &'a [String],
    ) -> StoreFuture<'a, BTreeSet<String>>;
}

pub trait RefreshSessionStore: Send + Sync {
    fn create(&self, session: NewRefreshSession) -> StoreFuture<'_, RefreshSession>;

    /// Active and unexpired session for a secret hash.
    fn find_active<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<RefreshSession>>;

    /// Mark the old session rotated and create its successor for the same user and tenant.
    ///
    /// Returns `None` when the old secret is no longer active; nothing is created then.
    fn rotate<'a>(
        &'a self,
        old_hash: &'a [u8],
        new_hash: Vec<u8>,
        ttl_seconds: i64,
    ) -> StoreFuture<'a, Option<RefreshSession>>;

    /// Returns `true` when an active session was revoked.
    fn revoke<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, bool>;

    fn revoke_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: Option<&'a str>,
    ) -> StoreFuture<'a, u64>;
}

/// Durable side of the token blocklist.
pub trait RevocationLedger: Send + Sync {
    fn block<'a>(&'a self, jti: &'a str, expires_at_unix: i64) -> StoreFuture<'a, ()>;

    fn is_blocked<'a>(&'a self, jti: &'a str) -> StoreFuture<'a, bool>;
}

/// Durable side of the authorization epoch.
pub trait EpochLedger: Send + Sync {
    fn epoch<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, Option<i64>>;

    /// Insert epoch 1 unless a row exists, then return the stored value.
    fn seed<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, i64>;
}

pub trait Readiness: Send + Sync {
    fn ping(&self) -> StoreFuture<'_, ()>;
}

/// Create a new refresh secret. Only its hash is persisted.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_refresh_secret() -> Result<String> {
    let mut bytes = [0u8; REFRESH_SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh secret")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[must_use]
pub fn hash_refresh_secret(secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_secrets_are_unique_and_url_safe() -> Result<()> {
        let first = generate_refresh_secret()?;
        let second = generate_refresh_secret()?;
        assert_ne!(first, second);
        // 48 bytes -> 64 base64 characters without padding
        assert_eq!(first.len(), 64);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn refresh_hash_is_sha256() {
        let hash = hash_refresh_secret("secret");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, hash_refresh_secret("secret"));
        assert_ne!(hash, hash_refresh_secret("secret2"));
    }

    #[test]
    fn membership_status_is_case_insensitive() {
        let mut membership = Membership {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            status: "ACTIVE".to_string(),
            roles: vec![],
            attrs: Map::new(),
        };
        assert!(membership.is_active());
        membership.status = "suspended".to_string();
        assert!(!membership.is_active());
    }
}
