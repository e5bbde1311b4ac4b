//! In-memory collaborators for tests.

use anyhow::{anyhow, Result};
use serde_json::Map;
use std::{
    collections::{BTreeSet, HashMap},
    future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};
use uuid::Uuid;

use super::{
    EpochLedger, Membership, MembershipResolver, NewRefreshSession, Readiness, RefreshSession,
    RefreshSessionStore, RevocationLedger, RoleResolver, SessionStatus, StoreFuture, TenantChoice,
};
use crate::token::now_unix_seconds;

#[derive(Clone, Debug)]
struct StoredSession {
    session: RefreshSession,
    status: SessionStatus,
}

#[derive(Default)]
struct State {
    tenants: HashMap<String, String>,
    memberships: HashMap<(String, String), Membership>,
    roles: HashMap<(String, String), Vec<String>>,
    sessions: HashMap<Vec<u8>, StoredSession>,
    revoked: HashMap<String, i64>,
    epochs: HashMap<(String, String), i64>,
}

/// Every durable trait over one mutex-guarded state, with call counters and failure switches.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    state: Mutex<State>,
    pub(crate) role_calls: AtomicUsize,
    pub(crate) role_delay: Mutex<Option<Duration>>,
    pub(crate) fail_memberships: AtomicBool,
    pub(crate) fail_sessions: AtomicBool,
    pub(crate) fail_ledgers: AtomicBool,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn add_tenant(&self, tenant_id: &str, name: &str) {
        self.state()
            .tenants
            .insert(tenant_id.to_string(), name.to_string());
    }

    pub(crate) fn add_membership(&self, tenant_id: &str, user_id: &str, status: &str, roles: &[&str]) {
        self.add_membership_with_attrs(tenant_id, user_id, status, roles, Map::new());
    }

    pub(crate) fn add_membership_with_attrs(
        &self,
        tenant_id: &str,
        user_id: &str,
        status: &str,
        roles: &[&str],
        attrs: Map<String, serde_json::Value>,
    ) {
        self.state().memberships.insert(
            (tenant_id.to_string(), user_id.to_string()),
            Membership {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                status: status.to_string(),
                roles: roles.iter().map(ToString::to_string).collect(),
                attrs,
            },
        );
    }

    pub(crate) fn add_role(&self, tenant_id: &str, name: &str, permissions: &[&str]) {
        self.state().roles.insert(
            (tenant_id.to_string(), name.to_string()),
            permissions.iter().map(ToString::to_string).collect(),
        );
    }

    pub(crate) fn set_epoch(&self, tenant_id: &str, user_id: &str, epoch: i64) {
        self.state()
            .epochs
            .insert((tenant_id.to_string(), user_id.to_string()), epoch);
    }

    pub(crate) fn session_status(&self, token_hash: &[u8]) -> Option<SessionStatus> {
        self.state().sessions.get(token_hash).map(|s| s.status)
    }

    pub(crate) fn active_sessions(&self, user_id: &str) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|s| s.session.user_id == user_id && s.status == SessionStatus::Active)
            .count()
    }

    pub(crate) fn is_jti_recorded(&self, jti: &str) -> bool {
        self.state().revoked.contains_key(jti)
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(anyhow!("connection refused"))
        } else {
            Ok(())
        }
    }

    fn insert_session(&self, session: NewRefreshSession) -> RefreshSession {
        let record = RefreshSession {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            tenant_id: session.tenant_id,
            expires_at_unix: now_unix_seconds() + session.ttl_seconds,
        };
        self.state().sessions.insert(
            session.token_hash,
            StoredSession {
                session: record.clone(),
                status: SessionStatus::Active,
            },
        );
        record
    }

    fn active_session(&self, token_hash: &[u8]) -> Option<RefreshSession> {
        let now = now_unix_seconds();
        self.state()
            .sessions
            .get(token_hash)
            .filter(|s| s.status == SessionStatus::Active && s.session.expires_at_unix > now)
            .map(|s| s.session.clone())
    }
}

impl MembershipResolver for MemoryBackend {
    fn membership<'a>(
        &'a self,
        tenant_id: &'a str,
        user_id: &'a str,
    ) -> StoreFuture<'a, Option<Membership>> {
        let result = Self::check(&self.fail_memberships).map(|()| {
            self.state()
                .memberships
                .get(&(tenant_id.to_string(), user_id.to_string()))
                .cloned()
        });
        Box::pin(future::ready(result))
    }

    fn active_tenants<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Vec<TenantChoice>> {
        let result = Self::check(&self.fail_memberships).map(|()| {
            let state = self.state();
            let mut tenants: Vec<TenantChoice> = state
                .memberships
                .values()
                .filter(|m| m.user_id == user_id && m.is_active())
                .map(|m| TenantChoice {
                    tenant_id: m.tenant_id.clone(),
                    name: state
                        .tenants
                        .get(&m.tenant_id)
                        .cloned()
                        .unwrap_or_else(|| m.tenant_id.clone()),
                })
                .collect();
            tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
            tenants
        });
        Box::pin(future::ready(result))
    }

    fn tenant_name<'a>(&'a self, tenant_id: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(future::ready(Ok(self.state().tenants.get(tenant_id).cloned())))
    }
}

impl RoleResolver for MemoryBackend {
    fn permissions_for_roles<'a>(
        &'a self,
        tenant_id: &'a str,
        roles: &'a [String],
    ) -> StoreFuture<'a, BTreeSet<String>> {
        Box::pin(async move {
            self.role_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self
                .role_delay
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let state = self.state();
            Ok(roles
                .iter()
                .filter_map(|role| state.roles.get(&(tenant_id.to_string(), role.clone())))
                .flatten()
                .cloned()
                .collect())
        })
    }
}

impl RefreshSessionStore for MemoryBackend {
    fn create(&self, session: NewRefreshSession) -> StoreFuture<'_, RefreshSession> {
        let result = Self::check(&self.fail_sessions).map(|()| self.insert_session(session));
        Box::pin(future::ready(result))
    }

    fn find_active<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<RefreshSession>> {
        let result = Self::check(&self.fail_sessions).map(|()| self.active_session(token_hash));
        Box::pin(future::ready(result))
    }

    fn rotate<'a>(
        &'a self,
        old_hash: &'a [u8],
        new_hash: Vec<u8>,
        ttl_seconds: i64,
    ) -> StoreFuture<'a, Option<RefreshSession>> {
        let result = Self::check(&self.fail_sessions).map(|()| {
            let old = self.active_session(old_hash)?;
            if let Some(stored) = self.state().sessions.get_mut(old_hash) {
                stored.status = SessionStatus::Rotated;
            }
            Some(self.insert_session(NewRefreshSession {
                user_id: old.user_id,
                tenant_id: old.tenant_id,
                token_hash: new_hash,
                ttl_seconds,
                device: None,
            }))
        });
        Box::pin(future::ready(result))
    }

    fn revoke<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, bool> {
        let result = Self::check(&self.fail_sessions).map(|()| {
            match self.state().sessions.get_mut(token_hash) {
                Some(stored) if stored.status == SessionStatus::Active => {
                    stored.status = SessionStatus::Revoked;
                    true
                }
                _ => false,
            }
        });
        Box::pin(future::ready(result))
    }

    fn revoke_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: Option<&'a str>,
    ) -> StoreFuture<'a, u64> {
        let result = Self::check(&self.fail_sessions).map(|()| {
            let mut count = 0;
            for stored in self.state().sessions.values_mut() {
                if stored.session.user_id == user_id
                    && tenant_id.map_or(true, |tid| stored.session.tenant_id == tid)
                    && stored.status == SessionStatus::Active
                {
                    stored.status = SessionStatus::Revoked;
                    count += 1;
                }
            }
            count
        });
        Box::pin(future::ready(result))
    }
}

impl RevocationLedger for MemoryBackend {
    fn block<'a>(&'a self, jti: &'a str, expires_at_unix: i64) -> StoreFuture<'a, ()> {
        let result = Self::check(&self.fail_ledgers).map(|()| {
            self.state()
                .revoked
                .insert(jti.to_string(), expires_at_unix);
        });
        Box::pin(future::ready(result))
    }

    fn is_blocked<'a>(&'a self, jti: &'a str) -> StoreFuture<'a, bool> {
        let now = now_unix_seconds();
        let result = Self::check(&self.fail_ledgers)
            .map(|()| self.state().revoked.get(jti).is_some_and(|exp| *exp > now));
        Box::pin(future::ready(result))
    }
}

impl EpochLedger for MemoryBackend {
    fn epoch<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, Option<i64>> {
        let result = Self::check(&self.fail_ledgers).map(|()| {
            self.state()
                .epochs
                .get(&(tenant_id.to_string(), user_id.to_string()))
                .copied()
        });
        Box::pin(future::ready(result))
    }

    fn seed<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, i64> {
        let result = Self::check(&self.fail_ledgers).map(|()| {
            *self
                .state()
                .epochs
                .entry((tenant_id.to_string(), user_id.to_string()))
                .or_insert(1)
        });
        Box::pin(future::ready(result))
    }
}

impl Readiness for MemoryBackend {
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(future::ready(Self::check(&self.fail_ledgers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hash_refresh_secret;

    fn new_session(secret: &str) -> NewRefreshSession {
        NewRefreshSession {
            user_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            token_hash: hash_refresh_secret(secret),
            ttl_seconds: 60,
            device: None,
        }
    }

    #[tokio::test]
    async fn rotation_invalidates_old_secret_once() -> Result<()> {
        let store = MemoryBackend::new();
        store.create(new_session("old")).await?;

        let old_hash = hash_refresh_secret("old");
        let new_hash = hash_refresh_secret("new");
        let rotated = store.rotate(&old_hash, new_hash.clone(), 60).await?;
        assert!(rotated.is_some());
        assert!(store.find_active(&old_hash).await?.is_none());
        assert_eq!(store.session_status(&old_hash), Some(SessionStatus::Rotated));

        let found = store.find_active(&new_hash).await?;
        assert_eq!(found.map(|s| (s.user_id, s.tenant_id)), Some(("u1".to_string(), "t1".to_string())));

        // second rotation with the old secret creates nothing
        let again = store.rotate(&old_hash, hash_refresh_secret("other"), 60).await?;
        assert!(again.is_none());
        assert_eq!(store.active_sessions("u1"), 1);
        Ok(())
    }
}
