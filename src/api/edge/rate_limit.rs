//! Fixed-window rate limiting for the session endpoints.
//!
//! Counters live in the volatile store under `rl:auth:{scope}:{subject}:{bucket}`. When the
//! store cannot answer, the request is let through and the failure is logged.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde_json::json;
use std::{fmt, net::SocketAddr, sync::Arc, sync::OnceLock, time::Duration};
use tracing::warn;

use crate::{
    api::{
        error::{ApiError, ErrorCode},
        handlers::auth::{
            utils::{extract_bearer_token, extract_client_ip},
            AuthState,
        },
    },
    cache::VolatileStore,
    token::now_unix_seconds_u64,
};

const FALLBACK_LIMIT: u64 = 60;
const FALLBACK_WINDOW_SECONDS: u64 = 60;

/// `count` requests per `window_seconds`, parsed from specs like `20/m`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSpec {
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateSpec {
    #[must_use]
    pub const fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    /// Parse `<count>/<s|m|h|d>`. Anything else falls back to 60 per minute.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| Regex::new(r"(?i)^\s*(\d+)\s*/\s*([smhd])\s*$").ok());

        let parsed = pattern.as_ref().and_then(|regex| {
            let captures = regex.captures(spec)?;
            let limit = captures.get(1)?.as_str().parse::<u64>().ok()?;
            let window_seconds = match captures.get(2)?.as_str().to_ascii_lowercase().as_str() {
                "s" => 1,
                "m" => 60,
                "h" => 3600,
                "d" => 86400,
                _ => return None,
            };
            Some(Self::new(limit, window_seconds))
        });

        parsed.unwrap_or_else(|| {
            warn!("Invalid rate limit spec {spec:?}, using {FALLBACK_LIMIT}/m");
            Self::new(FALLBACK_LIMIT, FALLBACK_WINDOW_SECONDS)
        })
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.window_seconds)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitScope {
    Ip,
    User,
}

impl RateLimitScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
    /// The counter store was unavailable.
    Skipped,
}

pub struct RateLimiter {
    store: Arc<dyn VolatileStore>,
    ip: RateSpec,
    user: RateSpec,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn VolatileStore>, ip: RateSpec, user: RateSpec) -> Self {
        Self { store, ip, user }
    }

    pub async fn check(&self, scope: RateLimitScope, subject: &str) -> RateLimitDecision {
        self.check_at(scope, subject, now_unix_seconds_u64()).await
    }

    async fn check_at(&self, scope: RateLimitScope, subject: &str, now: u64) -> RateLimitDecision {
        let spec = match scope {
            RateLimitScope::Ip => self.ip,
            RateLimitScope::User => self.user,
        };
        let window = spec.window_seconds.max(1);
        let bucket = now / window;
        let key = format!("rl:auth:{}:{subject}:{bucket}", scope.as_str());

        match self.store.incr(&key, Duration::from_secs(window)).await {
            Ok(count) if count > spec.limit => RateLimitDecision::Limited,
            Ok(_) => RateLimitDecision::Allowed,
            Err(err) => {
                warn!("Rate limit counter unavailable, skipping {} limit: {err}", scope.as_str());
                RateLimitDecision::Skipped
            }
        }
    }
}

fn limited(scope: RateLimitScope) -> Response {
    ApiError::new(ErrorCode::RateLimited, "Too many requests. Please slow down.")
        .with_details(json!({ "scope": scope.as_str() }))
        .into_response()
}

/// Apply the IP limit, and the user limit when a valid bearer token is present, to
/// requests under `{api_base_path}/auth/`.
pub async fn limit_auth_requests(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    let prefix = format!("{}/auth/", state.config().api_base_path());
    if !request.uri().path().starts_with(&prefix) {
        return next.run(request).await;
    }

    let headers = request.headers();
    let ip = extract_client_ip(headers)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    // Invalid tokens are ignored here; the endpoint rejects them.
    let user_id = extract_bearer_token(headers)
        .and_then(|token| state.tokens().verify(&token).ok())
        .map(|claims| claims.sub);

    let limiter = state.rate_limiter();
    if limiter.check(RateLimitScope::Ip, &ip).await == RateLimitDecision::Limited {
        return limited(RateLimitScope::Ip);
    }
    if let Some(user_id) = user_id {
        if limiter.check(RateLimitScope::User, &user_id).await == RateLimitDecision::Limited {
            return limited(RateLimitScope::User);
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{test_support::DownStore, MemoryStore};

    #[test]
    fn parses_rate_specs() {
        assert_eq!(RateSpec::parse("20/m"), RateSpec::new(20, 60));
        assert_eq!(RateSpec::parse(" 5 / S "), RateSpec::new(5, 1));
        assert_eq!(RateSpec::parse("100/h"), RateSpec::new(100, 3600));
        assert_eq!(RateSpec::parse("1/d"), RateSpec::new(1, 86400));
    }

    #[test]
    fn invalid_spec_falls_back() {
        assert_eq!(RateSpec::parse("often"), RateSpec::new(60, 60));
        assert_eq!(RateSpec::parse("10/w"), RateSpec::new(60, 60));
        assert_eq!(RateSpec::parse(""), RateSpec::new(60, 60));
    }

    #[tokio::test]
    async fn limits_after_threshold_within_bucket() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateSpec::new(2, 60),
            RateSpec::new(600, 60),
        );
        let now = 1_700_000_000;
        assert_eq!(limiter.check_at(RateLimitScope::Ip, "10.0.0.1", now).await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at(RateLimitScope::Ip, "10.0.0.1", now).await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at(RateLimitScope::Ip, "10.0.0.1", now).await, RateLimitDecision::Limited);
        // other subjects and the next bucket are independent
        assert_eq!(limiter.check_at(RateLimitScope::Ip, "10.0.0.2", now).await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at(RateLimitScope::Ip, "10.0.0.1", now + 60).await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn store_outage_skips_limiting() {
        let limiter = RateLimiter::new(Arc::new(DownStore), RateSpec::new(0, 60), RateSpec::new(0, 60));
        assert_eq!(limiter.check(RateLimitScope::User, "u1").await, RateLimitDecision::Skipped);
    }
}
