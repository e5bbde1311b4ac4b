//! Upstream identity-provider token verification.
//!
//! Flow Overview: read the unverified header, pick a strategy from `alg`
//! (`HS256` uses the shared secret, `RS256`/`ES256` use the provider's published key
//! set), then validate signature, `exp`, `sub` and audience with zero leeway.
//!
//! Key set caching: keys are kept in memory with a TTL and refreshed when stale or
//! when a token names an unknown `kid` (with a cooldown). A failed refresh keeps the
//! last known key set.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use reqwest::{
    header::{ETAG, IF_NONE_MATCH},
    Client,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};

use super::{now_unix_seconds_u64, Error};

const KEYSET_CACHE_TTL_SECONDS: u64 = 300;
const KEYSET_REFRESH_COOLDOWN_SECONDS: u64 = 30;
const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Claims the gateway needs from the upstream token.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug)]
enum KeySetSource {
    /// Keys supplied up front, never refreshed.
    Static,
    /// Keys fetched from the provider's JWKS endpoint.
    Remote { url: String, client: Client },
}

#[derive(Debug)]
struct KeySetCache {
    keys: JwkSet,
    fetched_at: Option<Instant>,
    etag: Option<String>,
}

impl KeySetCache {
    fn is_fresh(&self) -> bool {
        self.fetched_at
            .is_some_and(|at| at.elapsed() < Duration::from_secs(KEYSET_CACHE_TTL_SECONDS))
    }
}

#[derive(Debug)]
struct KeySet {
    source: KeySetSource,
    cache: RwLock<KeySetCache>,
    last_refresh_unix: AtomicU64,
}

impl KeySet {
    async fn find(&self, kid: &str) -> Result<Jwk, Error> {
        let fresh = self.cache.read().await.is_fresh();
        if !fresh {
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "failed to refresh upstream key set");
            }
        }

        if let Some(jwk) = self.cache.read().await.keys.find(kid) {
            return Ok(jwk.clone());
        }

        match self.refresh_on_unknown_kid().await {
            Ok(true) => self
                .cache
                .read()
                .await
                .keys
                .find(kid)
                .cloned()
                .ok_or_else(|| Error::UnknownKid(kid.to_string())),
            Ok(false) => Err(Error::UnknownKid(kid.to_string())),
            Err(err) => Err(Error::KeySetUnavailable(err.to_string())),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let (url, client) = match &self.source {
            KeySetSource::Static => return Ok(()),
            KeySetSource::Remote { url, client } => (url, client),
        };
        let etag = self.cache.read().await.etag.clone();

        match fetch_key_set(client, url, etag.as_deref()).await? {
            FetchOutcome::NotModified => {
                self.cache.write().await.fetched_at = Some(Instant::now());
            }
            FetchOutcome::Updated { keys, etag } => {
                let mut cache = self.cache.write().await;
                cache.keys = keys;
                cache.fetched_at = Some(Instant::now());
                cache.etag = etag;
                info!(keys = cache.keys.keys.len(), "upstream key set refreshed");
            }
        }
        Ok(())
    }

    /// Refresh when a token names an unknown `kid`, at most once per cooldown.
    async fn refresh_on_unknown_kid(&self) -> Result<bool> {
        if matches!(self.source, KeySetSource::Static) {
            return Ok(false);
        }
        let now = now_unix_seconds_u64();
        let last = self.last_refresh_unix.load(Ordering::Relaxed);
        if now.saturating_sub(last) < KEYSET_REFRESH_COOLDOWN_SECONDS {
            return Ok(false);
        }
        self.last_refresh_unix.store(now, Ordering::Relaxed);
        self.refresh().await?;
        Ok(true)
    }
}

enum FetchOutcome {
    NotModified,
    Updated { keys: JwkSet, etag: Option<String> },
}

async fn fetch_key_set(client: &Client, url: &str, etag: Option<&str>) -> Result<FetchOutcome> {
    let span = info_span!("upstream.jwks.fetch", http.method = "GET", url = %url);
    async {
        let mut request = client.get(url);
        if let Some(etag_value) = etag {
            request = request.header(IF_NONE_MATCH, etag_value);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 304 {
            return Ok(FetchOutcome::NotModified);
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(anyhow!("upstream key set fetch failed: {status}"));
        }

        let keys: JwkSet = serde_json::from_str(&body).context("Invalid upstream JWKS JSON")?;
        Ok(FetchOutcome::Updated { keys, etag })
    }
    .instrument(span)
    .await
}

/// Verifies identity-provider tokens presented to the exchange endpoint.
#[derive(Debug)]
pub struct UpstreamVerifier {
    audience: String,
    issuer: Option<String>,
    secret: Option<SecretString>,
    key_set: Option<KeySet>,
}

impl UpstreamVerifier {
    #[must_use]
    pub fn new(audience: String, issuer: Option<String>) -> Self {
        Self {
            audience,
            issuer,
            secret: None,
            key_set: None,
        }
    }

    /// Enable the legacy shared-secret (`HS256`) strategy.
    #[must_use]
    pub fn with_shared_secret(mut self, secret: SecretString) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Enable the asymmetric strategy backed by a remote JWKS URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn with_jwks_url(mut self, url: String) -> Result<Self> {
        url::Url::parse(&url).with_context(|| format!("Invalid upstream JWKS URL: {url}"))?;
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("Failed to build upstream JWKS HTTP client")?;
        self.key_set = Some(KeySet {
            source: KeySetSource::Remote { url, client },
            cache: RwLock::new(KeySetCache {
                keys: JwkSet { keys: Vec::new() },
                fetched_at: None,
                etag: None,
            }),
            last_refresh_unix: AtomicU64::new(0),
        });
        Ok(self)
    }

    /// Enable the asymmetric strategy with a fixed key set.
    #[must_use]
    pub fn with_key_set(mut self, keys: JwkSet) -> Self {
        self.key_set = Some(KeySet {
            source: KeySetSource::Static,
            cache: RwLock::new(KeySetCache {
                keys,
                fetched_at: Some(Instant::now()),
                etag: None,
            }),
            last_refresh_unix: AtomicU64::new(0),
        });
        self
    }

    /// Verify an upstream token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error for any header, key, signature or claim problem. Callers must
    /// not surface the variant.
    pub async fn verify(&self, token: &str) -> Result<UpstreamClaims, Error> {
        let header = decode_header(token)?;
        match header.alg {
            Algorithm::HS256 => {
                let secret = self
                    .secret
                    .as_ref()
                    .ok_or(Error::StrategyUnavailable("HS256"))?;
                let key = DecodingKey::from_secret(secret.expose_secret().as_bytes());
                self.decode(token, &key, Algorithm::HS256)
            }
            Algorithm::RS256 | Algorithm::ES256 => {
                let key_set = self
                    .key_set
                    .as_ref()
                    .ok_or(Error::StrategyUnavailable("JWKS"))?;
                let kid = header.kid.ok_or(Error::MissingClaim("kid"))?;
                let jwk = key_set.find(&kid).await?;
                let key = DecodingKey::from_jwk(&jwk)?;
                self.decode(token, &key, header.alg)
            }
            other => Err(Error::UnsupportedAlg(format!("{other:?}"))),
        }
    }

    fn decode(&self, token: &str, key: &DecodingKey, alg: Algorithm) -> Result<UpstreamClaims, Error> {
        let mut validation = Validation::new(alg);
        validation.leeway = 0;
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        let data = decode::<UpstreamClaims>(token, key, &validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(Error::MissingClaim("sub"));
        }
        Ok(data.claims)
    }
}
