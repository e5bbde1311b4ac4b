//! Auth state and configuration shared by the guard chain and the session endpoints.

use std::sync::Arc;

use crate::{
    api::edge::{RateLimiter, RateSpec},
    cache::{AuthzCache, StalenessPolicy, VolatileStore},
    store::{MembershipResolver, Readiness, RefreshSessionStore, RoleResolver},
    token::{SessionTokens, UpstreamVerifier},
};

pub const DEFAULT_API_BASE_PATH: &str = "/api/v1";
pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 14 * 24 * 60 * 60;
pub const DEFAULT_UPSTREAM_PROVIDER: &str = "supabase";
pub const DEFAULT_RATE_LIMIT_IP: RateSpec = RateSpec::new(20, 60);
pub const DEFAULT_RATE_LIMIT_USER: RateSpec = RateSpec::new(600, 60);
pub const IDEMPOTENCY_TTL_SECONDS: u64 = 120;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    api_base_path: String,
    refresh_ttl_seconds: i64,
    allowed_origins: Vec<String>,
    cookie_domain: Option<String>,
    cookie_secure: bool,
    staleness_policy: StalenessPolicy,
    upstream_provider: String,
    rate_limit_ip: RateSpec,
    rate_limit_user: RateSpec,
}

impl AuthConfig {
    #[must_use]
    pub fn new(api_base_path: String) -> Self {
        // Routes are nested under the base path, so it must not end with a slash.
        let api_base_path = format!("/{}", api_base_path.trim_matches('/'));
        Self {
            api_base_path: if api_base_path == "/" {
                String::new()
            } else {
                api_base_path
            },
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            allowed_origins: Vec::new(),
            cookie_domain: None,
            cookie_secure: true,
            staleness_policy: StalenessPolicy::default(),
            upstream_provider: DEFAULT_UPSTREAM_PROVIDER.to_string(),
            rate_limit_ip: DEFAULT_RATE_LIMIT_IP,
            rate_limit_user: DEFAULT_RATE_LIMIT_USER,
        }
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    /// Origins are compared exactly, without a trailing slash.
    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins
            .into_iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain.filter(|domain| !domain.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_staleness_policy(mut self, policy: StalenessPolicy) -> Self {
        self.staleness_policy = policy;
        self
    }

    #[must_use]
    pub fn with_upstream_provider(mut self, provider: String) -> Self {
        self.upstream_provider = provider;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, ip: RateSpec, user: RateSpec) -> Self {
        self.rate_limit_ip = ip;
        self.rate_limit_user = user;
        self
    }

    #[must_use]
    pub fn api_base_path(&self) -> &str {
        &self.api_base_path
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    #[must_use]
    pub fn is_allowed_origin(&self, origin: &str) -> bool {
        let origin = origin.trim().trim_end_matches('/');
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn staleness_policy(&self) -> StalenessPolicy {
        self.staleness_policy
    }

    #[must_use]
    pub fn upstream_provider(&self) -> &str {
        &self.upstream_provider
    }

    #[must_use]
    pub fn rate_limit_ip(&self) -> RateSpec {
        self.rate_limit_ip
    }

    #[must_use]
    pub fn rate_limit_user(&self) -> RateSpec {
        self.rate_limit_user
    }

    #[must_use]
    pub fn refresh_cookie_path(&self) -> String {
        format!("{}/auth/refresh", self.api_base_path)
    }
}

/// Durable collaborators behind the auth flows.
#[derive(Clone)]
pub struct Backends {
    pub memberships: Arc<dyn MembershipResolver>,
    pub roles: Arc<dyn RoleResolver>,
    pub sessions: Arc<dyn RefreshSessionStore>,
    pub readiness: Arc<dyn Readiness>,
}

impl Backends {
    /// Use one store for every concern.
    #[must_use]
    pub fn single<S>(store: Arc<S>) -> Self
    where
        S: MembershipResolver + RoleResolver + RefreshSessionStore + Readiness + 'static,
    {
        Self {
            memberships: store.clone(),
            roles: store.clone(),
            sessions: store.clone(),
            readiness: store,
        }
    }
}

pub struct AuthState {
    config: AuthConfig,
    tokens: SessionTokens,
    upstream: UpstreamVerifier,
    cache: AuthzCache,
    backends: Backends,
    rate_limiter: RateLimiter,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        tokens: SessionTokens,
        upstream: UpstreamVerifier,
        cache: AuthzCache,
        backends: Backends,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            Arc::clone(cache.volatile()),
            config.rate_limit_ip(),
            config.rate_limit_user(),
        );
        Self {
            config,
            tokens,
            upstream,
            cache,
            backends,
            rate_limiter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn tokens(&self) -> &SessionTokens {
        &self.tokens
    }

    #[must_use]
    pub fn upstream(&self) -> &UpstreamVerifier {
        &self.upstream
    }

    #[must_use]
    pub fn cache(&self) -> &AuthzCache {
        &self.cache
    }

    #[must_use]
    pub fn volatile(&self) -> &Arc<dyn VolatileStore> {
        self.cache.volatile()
    }

    #[must_use]
    pub fn memberships(&self) -> &dyn MembershipResolver {
        self.backends.memberships.as_ref()
    }

    #[must_use]
    pub fn roles(&self) -> Arc<dyn RoleResolver> {
        Arc::clone(&self.backends.roles)
    }

    #[must_use]
    pub fn sessions(&self) -> &dyn RefreshSessionStore {
        self.backends.sessions.as_ref()
    }

    #[must_use]
    pub fn readiness(&self) -> &dyn Readiness {
        self.backends.readiness.as_ref()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
