//! Postgres implementation of every durable collaborator.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Row,
};
use std::{collections::BTreeSet, str::FromStr, time::Duration};
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    EpochLedger, Membership, MembershipResolver, NewRefreshSession, Readiness, RefreshSession,
    RefreshSessionStore, RevocationLedger, RoleResolver, SessionStatus, StoreFuture, TenantChoice,
};

/// Connect the process-wide pool.
///
/// `connect_timeout` bounds pool acquisition, `statement_timeout` is applied to every
/// connection by the server.
///
/// # Errors
/// Returns an error if the DSN is invalid or the database is unreachable.
pub async fn connect(
    dsn: &str,
    connect_timeout: Duration,
    statement_timeout: Duration,
) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(dsn)
        .context("Invalid database DSN")?
        .options([(
            "statement_timeout",
            statement_timeout.as_millis().to_string(),
        )]);

    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(connect_timeout)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .context("Failed to connect to database")
}

fn query_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn membership_row(&self, tenant_id: &str, user_id: &str) -> Result<Option<Membership>> {
        let query = r"
            SELECT tenant_id, user_id, status, roles, attrs
            FROM memberships
            WHERE tenant_id = $1 AND user_id = $2
        ";
        let row = sqlx::query(query)
            .bind(tenant_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup membership")?;

        Ok(row.map(|row| {
            let attrs: Option<Value> = row.get("attrs");
            Membership {
                tenant_id: row.get("tenant_id"),
                user_id: row.get("user_id"),
                status: row.get("status"),
                roles: row.get::<Option<Vec<String>>, _>("roles").unwrap_or_default(),
                attrs: match attrs {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                },
            }
        }))
    }

    async fn active_tenant_rows(&self, user_id: &str) -> Result<Vec<TenantChoice>> {
        let query = r"
            SELECT m.tenant_id, COALESCE(t.name, m.tenant_id) AS name
            FROM memberships m
            LEFT JOIN tenants t ON t.id = m.tenant_id
            WHERE m.user_id = $1 AND lower(m.status) = 'active'
            ORDER BY m.tenant_id
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list active memberships")?;

        Ok(rows
            .into_iter()
            .map(|row| TenantChoice {
                tenant_id: row.get("tenant_id"),
                name: row.get("name"),
            })
            .collect())
    }

    async fn tenant_name_row(&self, tenant_id: &str) -> Result<Option<String>> {
        let query = "SELECT name FROM tenants WHERE id = $1";
        let row = sqlx::query(query)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup tenant")?;
        Ok(row.map(|row| row.get("name")))
    }

    async fn role_permissions(&self, tenant_id: &str, roles: &[String]) -> Result<BTreeSet<String>> {
        if roles.is_empty() {
            return Ok(BTreeSet::new());
        }
        let query = r"
            SELECT DISTINCT unnest(permissions) AS permission
            FROM roles
            WHERE tenant_id = $1 AND name = ANY($2)
        ";
        let rows = sqlx::query(query)
            .bind(tenant_id)
            .bind(roles)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to resolve role permissions")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("permission"))
            .collect())
    }

    async fn insert_session(&self, session: NewRefreshSession) -> Result<RefreshSession> {
        let query = r"
            INSERT INTO refresh_sessions
                (id, user_id, tenant_id, token_hash, status, expires_at, device)
            VALUES ($1, $2, $3, $4, $5, now() + ($6::bigint * interval '1 second'), $7)
            RETURNING id, user_id, tenant_id, EXTRACT(EPOCH FROM expires_at)::bigint AS expires_at_unix
        ";
        let row = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(&session.user_id)
            .bind(&session.tenant_id)
            .bind(&session.token_hash)
            .bind(SessionStatus::Active.as_str())
            .bind(session_ttl(session.ttl_seconds))
            .bind(&session.device)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert refresh session")?;
        Ok(session_from_row(&row))
    }

    async fn find_active_row(&self, token_hash: &[u8]) -> Result<Option<RefreshSession>> {
        let query = r"
            SELECT id, user_id, tenant_id, EXTRACT(EPOCH FROM expires_at)::bigint AS expires_at_unix
            FROM refresh_sessions
            WHERE token_hash = $1 AND status = 'active' AND expires_at > now()
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup refresh session")?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn rotate_rows(
        &self,
        old_hash: &[u8],
        new_hash: Vec<u8>,
        ttl_seconds: i64,
    ) -> Result<Option<RefreshSession>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin refresh rotation transaction")?;

        // Conditional on status so two concurrent rotations cannot both win.
        let query = r"
            UPDATE refresh_sessions
            SET status = 'rotated', rotated_at = now()
            WHERE token_hash = $1 AND status = 'active' AND expires_at > now()
            RETURNING user_id, tenant_id, device
        ";
        let row = sqlx::query(query)
            .bind(old_hash)
            .fetch_optional(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to rotate refresh session")?;

        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(None);
        };
        let user_id: String = row.get("user_id");
        let tenant_id: String = row.get("tenant_id");
        let device: Option<Value> = row.get("device");

        let query = r"
            INSERT INTO refresh_sessions
                (id, user_id, tenant_id, token_hash, status, expires_at, device)
            VALUES ($1, $2, $3, $4, 'active', now() + ($5::bigint * interval '1 second'), $6)
            RETURNING id, user_id, tenant_id, EXTRACT(EPOCH FROM expires_at)::bigint AS expires_at_unix
        ";
        let row = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(&user_id)
            .bind(&tenant_id)
            .bind(&new_hash)
            .bind(session_ttl(ttl_seconds))
            .bind(&device)
            .fetch_one(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert rotated refresh session")?;
        let session = session_from_row(&row);

        tx.commit()
            .await
            .context("commit refresh rotation transaction")?;
        Ok(Some(session))
    }

    async fn revoke_row(&self, token_hash: &[u8]) -> Result<bool> {
        let query = r"
            UPDATE refresh_sessions
            SET status = 'revoked', revoked_at = now()
            WHERE token_hash = $1 AND status = 'active'
        ";
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke refresh session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_user_rows(&self, user_id: &str, tenant_id: Option<&str>) -> Result<u64> {
        let query = r"
            UPDATE refresh_sessions
            SET status = 'revoked', revoked_at = now()
            WHERE user_id = $1
              AND ($2::text IS NULL OR tenant_id = $2)
              AND status = 'active'
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke user refresh sessions")?;
        Ok(result.rows_affected())
    }

    async fn block_row(&self, jti: &str, expires_at_unix: i64) -> Result<()> {
        let query = r"
            INSERT INTO revoked_tokens (jti, expires_at)
            VALUES ($1, to_timestamp($2::bigint))
            ON CONFLICT (jti) DO UPDATE SET expires_at = GREATEST(revoked_tokens.expires_at, EXCLUDED.expires_at)
        ";
        sqlx::query(query)
            .bind(jti)
            .bind(expires_at_unix)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to record revoked token")?;
        Ok(())
    }

    async fn blocked_row(&self, jti: &str) -> Result<bool> {
        let query = "SELECT 1 AS blocked FROM revoked_tokens WHERE jti = $1 AND expires_at > now()";
        let row = sqlx::query(query)
            .bind(jti)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup revoked token")?;
        Ok(row.is_some())
    }

    async fn epoch_row(&self, tenant_id: &str, user_id: &str) -> Result<Option<i64>> {
        let query = "SELECT epoch FROM authz_epochs WHERE tenant_id = $1 AND user_id = $2";
        let row = sqlx::query(query)
            .bind(tenant_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup authorization epoch")?;
        Ok(row.map(|row| row.get("epoch")))
    }

    async fn seed_row(&self, tenant_id: &str, user_id: &str) -> Result<i64> {
        let query = r"
            INSERT INTO authz_epochs (tenant_id, user_id, epoch)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, user_id) DO NOTHING
        ";
        sqlx::query(query)
            .bind(tenant_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to seed authorization epoch")?;

        Ok(self.epoch_row(tenant_id, user_id).await?.unwrap_or(1))
    }
}

fn session_ttl(ttl_seconds: i64) -> i64 {
    ttl_seconds.max(0)
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> RefreshSession {
    RefreshSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        tenant_id: row.get("tenant_id"),
        expires_at_unix: row.get("expires_at_unix"),
    }
}

impl MembershipResolver for PgStore {
    fn membership<'a>(
        &'a self,
        tenant_id: &'a str,
        user_id: &'a str,
    ) -> StoreFuture<'a, Option<Membership>> {
        Box::pin(self.membership_row(tenant_id, user_id))
    }

    fn active_tenants<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Vec<TenantChoice>> {
        Box::pin(self.active_tenant_rows(user_id))
    }

    fn tenant_name<'a>(&'a self, tenant_id: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.tenant_name_row(tenant_id))
    }
}

impl RoleResolver for PgStore {
    fn permissions_for_roles<'a>(
        &'a self,
        tenant_id: &'a str,
        roles: &'a [String],
    ) -> StoreFuture<'a, BTreeSet<String>> {
        Box::pin(self.role_permissions(tenant_id, roles))
    }
}

impl RefreshSessionStore for PgStore {
    fn create(&self, session: NewRefreshSession) -> StoreFuture<'_, RefreshSession> {
        Box::pin(self.insert_session(session))
    }

    fn find_active<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<RefreshSession>> {
        Box::pin(self.find_active_row(token_hash))
    }

    fn rotate<'a>(
        &'a self,
        old_hash: &'a [u8],
        new_hash: Vec<u8>,
        ttl_seconds: i64,
    ) -> StoreFuture<'a, Option<RefreshSession>> {
        Box::pin(self.rotate_rows(old_hash, new_hash, ttl_seconds))
    }

    fn revoke<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, bool> {
        Box::pin(self.revoke_row(token_hash))
    }

    fn revoke_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: Option<&'a str>,
    ) -> StoreFuture<'a, u64> {
        Box::pin(self.revoke_user_rows(user_id, tenant_id))
    }
}

impl RevocationLedger for PgStore {
    fn block<'a>(&'a self, jti: &'a str, expires_at_unix: i64) -> StoreFuture<'a, ()> {
        Box::pin(self.block_row(jti, expires_at_unix))
    }

    fn is_blocked<'a>(&'a self, jti: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.blocked_row(jti))
    }
}

impl EpochLedger for PgStore {
    fn epoch<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, Option<i64>> {
        Box::pin(self.epoch_row(tenant_id, user_id))
    }

    fn seed<'a>(&'a self, tenant_id: &'a str, user_id: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(self.seed_row(tenant_id, user_id))
    }
}

impl Readiness for PgStore {
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = "SELECT 1";
            sqlx::query(query)
                .execute(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("database ping failed")?;
            Ok(())
        })
    }
}
