//! Wiring for handler and guard tests: in-memory stores, the fixed signing key and an
//! HS256 upstream identity provider.

use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;

use super::state::{AuthConfig, AuthState, Backends, DEFAULT_API_BASE_PATH};
use crate::{
    cache::{test_support::DownStore, AuthzCache, MemoryStore, StalenessPolicy, VolatileStore},
    store::memory::MemoryBackend,
    token::{now_unix_seconds, test_keys::session_tokens, UpstreamVerifier},
};

pub(crate) const UPSTREAM_SECRET: &str = "upstream-shared-secret-for-tests";
pub(crate) const UPSTREAM_AUDIENCE: &str = "authenticated";
pub(crate) const ALLOWED_ORIGIN: &str = "https://app.example.test";

pub(crate) struct Harness {
    pub(crate) backend: Arc<MemoryBackend>,
    pub(crate) state: Arc<AuthState>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(test_config())
    }

    pub(crate) fn with_config(config: AuthConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), config)
    }

    /// Volatile store that fails every call.
    pub(crate) fn down() -> Self {
        Self::down_with_policy(StalenessPolicy::FailOpen)
    }

    pub(crate) fn down_with_policy(policy: StalenessPolicy) -> Self {
        Self::build(Arc::new(DownStore), test_config().with_staleness_policy(policy))
    }

    fn build(volatile: Arc<dyn VolatileStore>, config: AuthConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let cache = AuthzCache::new(volatile, backend.clone(), backend.clone());
        let tokens = session_tokens().expect("test signing key must load");
        let upstream = UpstreamVerifier::new(UPSTREAM_AUDIENCE.to_string(), None)
            .with_shared_secret(SecretString::from(UPSTREAM_SECRET));
        let state = Arc::new(AuthState::new(
            config,
            tokens,
            upstream,
            cache,
            Backends::single(backend.clone()),
        ));
        Self { backend, state }
    }
}

pub(crate) fn test_config() -> AuthConfig {
    AuthConfig::new(DEFAULT_API_BASE_PATH.to_string())
        .with_allowed_origins(vec![ALLOWED_ORIGIN.to_string()])
}

/// Identity token as the upstream provider would issue it.
pub(crate) fn upstream_token(user_id: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "sub": user_id,
            "exp": now_unix_seconds() + 300,
            "aud": UPSTREAM_AUDIENCE,
            "email": format!("{user_id}@example.test"),
        }),
        &EncodingKey::from_secret(UPSTREAM_SECRET.as_bytes()),
    )
    .expect("upstream token must encode")
}

pub(crate) fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}
