use anyhow::{anyhow, Context, Result};
use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{
    blocklist_key, epoch_key, permset_key, Lookup, SingleFlight, VolatileStore,
};
use crate::{
    store::{EpochLedger, RevocationLedger, RoleResolver},
    token::now_unix_seconds,
};

/// Extra lifetime given to blocklist entries beyond the token's own expiry.
pub const REVOCATION_MARGIN_SECONDS: i64 = 60;

pub const DEFAULT_PERMSET_TTL_SECONDS: u64 = 900;
pub const DEFAULT_EPOCH_TTL_SECONDS: u64 = 30;

/// What the staleness check does when no epoch can be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StalenessPolicy {
    /// Treat the token as fresh.
    #[default]
    FailOpen,
    /// Reject with `EV_OUTDATED` so the client refreshes.
    FailClosed,
}

impl FromStr for StalenessPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail-open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "closed" => Ok(Self::FailClosed),
            other => Err(anyhow!("unknown staleness policy: {other}")),
        }
    }
}

impl fmt::Display for StalenessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FailOpen => "fail-open",
            Self::FailClosed => "fail-closed",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationStatus {
    Revoked,
    Clear,
    /// Neither store gave a definitive answer.
    Unavailable,
}

/// Revocation, epoch and permission-set caching over a volatile store with a durable fallback.
pub struct AuthzCache {
    volatile: Arc<dyn VolatileStore>,
    revocations: Arc<dyn RevocationLedger>,
    epochs: Arc<dyn EpochLedger>,
    flights: Arc<SingleFlight>,
    permset_ttl: Duration,
    epoch_ttl: Duration,
}

impl AuthzCache {
    #[must_use]
    pub fn new(
        volatile: Arc<dyn VolatileStore>,
        revocations: Arc<dyn RevocationLedger>,
        epochs: Arc<dyn EpochLedger>,
    ) -> Self {
        Self {
            volatile,
            revocations,
            epochs,
            flights: Arc::new(SingleFlight::new()),
            permset_ttl: Duration::from_secs(DEFAULT_PERMSET_TTL_SECONDS),
            epoch_ttl: Duration::from_secs(DEFAULT_EPOCH_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_permset_ttl(mut self, ttl: Duration) -> Self {
        self.permset_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_epoch_ttl(mut self, ttl: Duration) -> Self {
        self.epoch_ttl = ttl;
        self
    }

    #[must_use]
    pub fn volatile(&self) -> &Arc<dyn VolatileStore> {
        &self.volatile
    }

    pub async fn revocation_status(&self, jti: &str) -> RevocationStatus {
        match self.volatile.get(&blocklist_key(jti)).await {
            Ok(Some(_)) => return RevocationStatus::Revoked,
            Ok(None) => {}
            Err(err) => warn!("Blocklist lookup in volatile store failed: {err}"),
        }

        match self.revocations.is_blocked(jti).await {
            Ok(true) => RevocationStatus::Revoked,
            Ok(false) => RevocationStatus::Clear,
            Err(err) => {
                warn!("Blocklist lookup in durable store failed: {err:#}");
                RevocationStatus::Unavailable
            }
        }
    }

    /// Block a token id until its expiry plus [`REVOCATION_MARGIN_SECONDS`].
    ///
    /// Returns `true` when at least one store recorded the entry.
    pub async fn block(&self, jti: &str, expires_at: i64) -> bool {
        let remaining = (expires_at - now_unix_seconds()).max(0);
        let ttl = Duration::from_secs(
            u64::try_from(remaining + REVOCATION_MARGIN_SECONDS).unwrap_or(0),
        );

        let volatile = match self
            .volatile
            .set(&blocklist_key(jti), "1".to_string(), Some(ttl))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to block token in volatile store: {err}");
                false
            }
        };
        let durable = match self
            .revocations
            .block(jti, expires_at.max(now_unix_seconds()) + REVOCATION_MARGIN_SECONDS)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to block token in durable store: {err:#}");
                false
            }
        };
        volatile || durable
    }

    /// Current epoch for (tenant, user): volatile first, then the durable row.
    pub async fn epoch(&self, tenant_id: &str, user_id: &str) -> Lookup<i64> {
        let key = epoch_key(tenant_id, user_id);
        match self.volatile.get(&key).await {
            Ok(Some(value)) => match value.parse::<i64>() {
                Ok(epoch) => return Lookup::Hit(epoch),
                Err(_) => warn!("Ignoring non-numeric epoch stored under {key}"),
            },
            Ok(None) => {}
            Err(err) => warn!("Epoch lookup in volatile store failed: {err}"),
        }

        match self.epochs.epoch(tenant_id, user_id).await {
            Ok(Some(epoch)) => {
                if let Err(err) = self
                    .volatile
                    .set(&key, epoch.to_string(), Some(self.epoch_ttl))
                    .await
                {
                    debug!("Could not repopulate epoch cache: {err}");
                }
                Lookup::Hit(epoch)
            }
            Ok(None) => Lookup::Miss,
            Err(err) => {
                warn!("Epoch lookup in durable store failed: {err:#}");
                Lookup::Unavailable
            }
        }
    }

    /// Read the epoch to embed in a new session token, seeding it to 1 on first use.
    pub async fn seed_epoch(&self, tenant_id: &str, user_id: &str) -> i64 {
        let key = epoch_key(tenant_id, user_id);
        match self.epochs.seed(tenant_id, user_id).await {
            Ok(epoch) => {
                if let Err(err) = self
                    .volatile
                    .set(&key, epoch.to_string(), Some(self.epoch_ttl))
                    .await
                {
                    debug!("Could not cache seeded epoch: {err}");
                }
                epoch
            }
            Err(err) => {
                warn!("Seeding epoch in durable store failed: {err:#}");
                match self.volatile.get(&key).await {
                    Ok(Some(value)) => value.parse().unwrap_or(1),
                    _ => {
                        if let Err(err) = self
                            .volatile
                            .set_if_absent(&key, "1".to_string(), Some(self.epoch_ttl))
                            .await
                        {
                            debug!("Could not cache fallback epoch: {err}");
                        }
                        1
                    }
                }
            }
        }
    }

    /// Permission set for (tenant, user), recomputed once per key on a cache miss.
    ///
    /// The recomputation runs on its own task so an abandoned request cannot leave the
    /// key's lock held or the cache half written.
    ///
    /// # Errors
    /// Returns an error if the role resolver fails.
    pub async fn permissions(
        &self,
        tenant_id: &str,
        user_id: &str,
        roles: &[String],
        resolver: Arc<dyn RoleResolver>,
    ) -> Result<BTreeSet<String>> {
        let key = permset_key(tenant_id, user_id);
        if let Lookup::Hit(permissions) = read_permset(self.volatile.as_ref(), &key).await {
            return Ok(permissions);
        }

        let volatile = Arc::clone(&self.volatile);
        let flights = Arc::clone(&self.flights);
        let ttl = self.permset_ttl;
        let tenant_id = tenant_id.to_string();
        let roles = roles.to_vec();

        let task = tokio::spawn(async move {
            flights
                .run(&key, || {
                    recompute(
                        volatile.as_ref(),
                        resolver.as_ref(),
                        &key,
                        &tenant_id,
                        &roles,
                        ttl,
                    )
                })
                .await
        });
        task.await.context("permission resolution task failed")?
    }

    /// Drop the cached permission set, e.g. after a role change.
    pub async fn invalidate_permissions(&self, tenant_id: &str, user_id: &str) {
        if let Err(err) = self.volatile.delete(&permset_key(tenant_id, user_id)).await {
            warn!("Failed to invalidate permission cache: {err}");
        }
    }
}

async fn read_permset(volatile: &dyn VolatileStore, key: &str) -> Lookup<BTreeSet<String>> {
    match volatile.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<BTreeSet<String>>(&raw) {
            Ok(permissions) => Lookup::Hit(permissions),
            Err(err) => {
                warn!("Ignoring malformed permission set under {key}: {err}");
                Lookup::Miss
            }
        },
        Ok(None) => Lookup::Miss,
        Err(err) => {
            warn!("Permission cache read failed: {err}");
            Lookup::Unavailable
        }
    }
}

async fn recompute(
    volatile: &dyn VolatileStore,
    resolver: &dyn RoleResolver,
    key: &str,
    tenant_id: &str,
    roles: &[String],
    ttl: Duration,
) -> Result<BTreeSet<String>> {
    // Another holder of this key may have filled the cache while we waited.
    if let Lookup::Hit(permissions) = read_permset(volatile, key).await {
        return Ok(permissions);
    }

    let permissions = resolver
        .permissions_for_roles(tenant_id, roles)
        .await
        .context("failed to resolve permissions")?;

    // BTreeSet serializes as a sorted array
    let encoded = serde_json::to_string(&permissions).context("failed to encode permissions")?;
    if let Err(err) = volatile.set(key, encoded, Some(ttl)).await {
        warn!("Failed to cache permission set: {err}");
    }
    Ok(permissions)
}
