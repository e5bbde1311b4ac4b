use rsa::errors::Error as RsaError;
use thiserror::Error;

/// Credential parsing, signing and verification failures.
///
/// These never reach a response body; handlers collapse them to `UNAUTHENTICATED`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("failed to encode public key")]
    KeyEncode,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    Immature,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
    #[error("upstream verification failed: {0}")]
    Upstream(#[from] jsonwebtoken::errors::Error),
    #[error("upstream key set unavailable: {0}")]
    KeySetUnavailable(String),
    #[error("no verification strategy configured for {0}")]
    StrategyUnavailable(&'static str),
}
