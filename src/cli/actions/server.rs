use crate::{
    api::{
        self,
        handlers::auth::{AuthConfig, AuthState, Backends},
    },
    cache::{AuthzCache, MemoryStore, VolatileStore},
    cli::{
        commands::{db, edge, session, upstream},
        telemetry,
    },
    store::{postgres, PgStore},
    token::{SessionTokens, SigningKeys, UpstreamVerifier},
};
use anyhow::{Context, Result};
use std::{fs, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub api_base_path: String,
    pub db: db::Options,
    pub session: session::Options,
    pub upstream: upstream::Options,
    pub edge: edge::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing key cannot be loaded, the database is unreachable, or the
/// server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let tokens = session_tokens(&args.session)?;
    let upstream::Options {
        issuer,
        audience,
        jwks_url,
        jwt_secret,
        provider,
    } = args.upstream;

    let mut upstream = UpstreamVerifier::new(audience, issuer);
    if let Some(url) = jwks_url {
        upstream = upstream.with_jwks_url(url)?;
    }
    if let Some(secret) = jwt_secret {
        upstream = upstream.with_shared_secret(secret);
    }

    let pool = postgres::connect(&args.dsn, args.db.connect_timeout, args.db.statement_timeout).await?;
    let store = Arc::new(PgStore::new(pool));

    let volatile: Arc<dyn VolatileStore> = Arc::new(MemoryStore::new());
    let cache = AuthzCache::new(volatile, store.clone(), store.clone())
        .with_permset_ttl(Duration::from_secs(args.session.permset_ttl_seconds))
        .with_epoch_ttl(Duration::from_secs(args.session.epoch_cache_ttl_seconds));

    let config = AuthConfig::new(args.api_base_path)
        .with_refresh_ttl_seconds(args.session.refresh_ttl_seconds)
        .with_staleness_policy(args.session.staleness_policy)
        .with_upstream_provider(provider)
        .with_allowed_origins(args.edge.allowed_origins)
        .with_cookie_domain(args.edge.cookie_domain)
        .with_cookie_secure(args.edge.cookie_secure)
        .with_rate_limits(args.edge.rate_limit_ip, args.edge.rate_limit_user);

    if config.allowed_origins().is_empty() {
        warn!("No allowed origins configured, cookie-mode requests will fail the origin check");
    }
    info!(
        api_base_path = config.api_base_path(),
        staleness_policy = %config.staleness_policy(),
        rate_limit_ip = %config.rate_limit_ip(),
        rate_limit_user = %config.rate_limit_user(),
        "Gateway configured"
    );

    let state = Arc::new(AuthState::new(
        config,
        tokens,
        upstream,
        cache,
        Backends::single(store),
    ));

    let result = api::new(args.port, state).await;

    telemetry::shutdown_tracer();

    result
}

fn session_tokens(options: &session::Options) -> Result<SessionTokens> {
    let key = fs::read(&options.signing_key_path)
        .with_context(|| format!("Failed to read signing key: {}", options.signing_key_path))?;
    let keys = SigningKeys::from_pem_or_der(&key).context("Invalid session signing key")?;
    info!(kid = keys.kid(), "Session signing key loaded");

    Ok(SessionTokens::new(
        Arc::new(keys),
        options.issuer.clone(),
        options.audience.clone(),
        options.access_ttl_seconds,
    ))
}
