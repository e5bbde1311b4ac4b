//! First-party session tokens (RS256 compact JWS).
//!
//! Header: `{alg:"RS256", typ:"JWT", kid}`. Claims: `sub`, `tid`, `ev`, `jti`, `iat`,
//! `exp`, `aud`, `iss`. Every claim is required on verification.

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use super::{now_unix_seconds, Error, SigningKeys};

/// Clock-skew allowance applied to `exp` and `iat`.
pub const SESSION_LEEWAY_SECONDS: i64 = 120;

const ALG_RS256: &str = "RS256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SessionTokenHeader {
    alg: String,
    typ: String,
    kid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: String,
    pub tid: String,
    pub ev: i64,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
    pub iss: String,
}

/// Wire shape used while verifying; any absent claim fails the token.
#[derive(Deserialize)]
struct PresentedClaims {
    sub: Option<String>,
    tid: Option<String>,
    ev: Option<i64>,
    jti: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    aud: Option<String>,
    iss: Option<String>,
}

fn required_text(value: Option<String>, name: &'static str) -> Result<String, Error> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(Error::MissingClaim(name))
}

impl TryFrom<PresentedClaims> for SessionClaims {
    type Error = Error;

    fn try_from(raw: PresentedClaims) -> Result<Self, Error> {
        Ok(Self {
            sub: required_text(raw.sub, "sub")?,
            tid: required_text(raw.tid, "tid")?,
            ev: raw.ev.ok_or(Error::MissingClaim("ev"))?,
            jti: required_text(raw.jti, "jti")?,
            iat: raw.iat.ok_or(Error::MissingClaim("iat"))?,
            exp: raw.exp.ok_or(Error::MissingClaim("exp"))?,
            aud: required_text(raw.aud, "aud")?,
            iss: required_text(raw.iss, "iss")?,
        })
    }
}

/// A freshly minted access token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: i64,
}

/// Mints and verifies session tokens with the service signing key.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    keys: Arc<SigningKeys>,
    issuer: String,
    audience: String,
    ttl_seconds: i64,
}

impl SessionTokens {
    #[must_use]
    pub fn new(keys: Arc<SigningKeys>, issuer: String, audience: String, ttl_seconds: i64) -> Self {
        Self {
            keys,
            issuer,
            audience,
            ttl_seconds,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &SigningKeys {
        &self.keys
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Mint a token with a fresh `jti`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header or claims cannot be encoded.
    pub fn issue(&self, user_id: &str, tenant_id: &str, epoch: i64) -> Result<IssuedToken, Error> {
        self.issue_at(user_id, tenant_id, epoch, now_unix_seconds())
    }

    /// # Errors
    ///
    /// Returns an error if the header or claims cannot be encoded.
    pub fn issue_at(
        &self,
        user_id: &str,
        tenant_id: &str,
        epoch: i64,
        now: i64,
    ) -> Result<IssuedToken, Error> {
        let claims = SessionClaims {
            sub: user_id.to_string(),
            tid: tenant_id.to_string(),
            ev: epoch,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl_seconds,
            aud: self.audience.clone(),
            iss: self.issuer.clone(),
        };
        let header = SessionTokenHeader {
            alg: ALG_RS256.to_string(),
            typ: "JWT".to_string(),
            kid: self.keys.kid().to_string(),
        };

        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);
        let signing_key = SigningKey::<Sha256>::new(self.keys.private_key().clone());
        let signature: Signature = signing_key.sign(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());

        Ok(IssuedToken {
            token: format!("{signing_input}.{signature_b64}"),
            jti: claims.jti,
            expires_at: claims.exp,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the token is malformed, signed by another key, or fails
    /// the issuer, audience or time checks.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, Error> {
        self.verify_at(token, now_unix_seconds())
    }

    /// # Errors
    ///
    /// See [`SessionTokens::verify`].
    pub fn verify_at(&self, token: &str, now: i64) -> Result<SessionClaims, Error> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }

        let header: SessionTokenHeader = b64d_json(header_b64)?;
        if header.alg != ALG_RS256 {
            return Err(Error::UnsupportedAlg(header.alg));
        }
        if header.kid != self.keys.kid() {
            return Err(Error::UnknownKid(header.kid));
        }

        let verifying_key = VerifyingKey::<Sha256>::new(self.keys.public_key().clone());
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
        let signature =
            Signature::try_from(signature_bytes.as_slice()).map_err(|_| Error::InvalidSignature)?;
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| Error::InvalidSignature)?;

        let presented: PresentedClaims = b64d_json(claims_b64)?;
        let claims = SessionClaims::try_from(presented)?;
        if claims.iss != self.issuer {
            return Err(Error::InvalidIssuer);
        }
        if claims.aud != self.audience {
            return Err(Error::InvalidAudience);
        }
        if claims.exp + SESSION_LEEWAY_SECONDS <= now {
            return Err(Error::Expired);
        }
        if claims.iat - SESSION_LEEWAY_SECONDS > now {
            return Err(Error::Immature);
        }

        Ok(claims)
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_keys::session_tokens;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn issue_and_verify() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let issued = tokens.issue_at("u1", "t1", 3, NOW)?;
        assert_eq!(issued.expires_at, NOW + 900);

        let claims = tokens.verify_at(&issued.token, NOW + 10)?;
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.tid, "t1");
        assert_eq!(claims.ev, 3);
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.iss, "pasejo-api");
        assert_eq!(claims.aud, "pasejo-app");
        Ok(())
    }

    #[test]
    fn header_carries_key_id() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let issued = tokens.issue_at("u1", "t1", 1, NOW)?;
        let header_b64 = issued.token.split('.').next().ok_or(Error::TokenFormat)?;
        let header: SessionTokenHeader = b64d_json(header_b64)?;
        assert_eq!(header.alg, "RS256");
        assert_eq!(header.typ, "JWT");
        assert_eq!(header.kid, tokens.keys().kid());
        Ok(())
    }

    #[test]
    fn every_token_gets_a_fresh_jti() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let first = tokens.issue_at("u1", "t1", 1, NOW)?;
        let second = tokens.issue_at("u1", "t1", 1, NOW)?;
        assert_ne!(first.jti, second.jti);
        Ok(())
    }

    #[test]
    fn expiry_honours_leeway() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let issued = tokens.issue_at("u1", "t1", 1, NOW)?;
        let exp = issued.expires_at;

        assert!(tokens.verify_at(&issued.token, exp + 60).is_ok());
        assert!(matches!(
            tokens.verify_at(&issued.token, exp + SESSION_LEEWAY_SECONDS),
            Err(Error::Expired)
        ));
        assert!(matches!(
            tokens.verify_at(&issued.token, NOW - SESSION_LEEWAY_SECONDS - 1),
            Err(Error::Immature)
        ));
        Ok(())
    }

    #[test]
    fn rejects_wrong_audience_or_issuer() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let issued = tokens.issue_at("u1", "t1", 1, NOW)?;

        let other_audience = SessionTokens::new(
            Arc::clone(&tokens.keys),
            "pasejo-api".to_string(),
            "someone-else".to_string(),
            900,
        );
        assert!(matches!(
            other_audience.verify_at(&issued.token, NOW),
            Err(Error::InvalidAudience)
        ));

        let other_issuer = SessionTokens::new(
            Arc::clone(&tokens.keys),
            "another-api".to_string(),
            "pasejo-app".to_string(),
            900,
        );
        assert!(matches!(
            other_issuer.verify_at(&issued.token, NOW),
            Err(Error::InvalidIssuer)
        ));
        Ok(())
    }

    #[test]
    fn rejects_tampered_claims() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let issued = tokens.issue_at("u1", "t1", 1, NOW)?;
        let mut parts: Vec<&str> = issued.token.split('.').collect();
        let forged = SessionClaims {
            sub: "u2".to_string(),
            tid: "t1".to_string(),
            ev: 1,
            jti: issued.jti.clone(),
            iat: NOW,
            exp: NOW + 900,
            aud: "pasejo-app".to_string(),
            iss: "pasejo-api".to_string(),
        };
        let forged_b64 = b64e_json(&forged)?;
        parts[1] = &forged_b64;
        let forged_token = parts.join(".");
        assert!(matches!(
            tokens.verify_at(&forged_token, NOW),
            Err(Error::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn rejects_missing_claims() -> Result<(), Error> {
        let tokens = session_tokens()?;
        let header = SessionTokenHeader {
            alg: ALG_RS256.to_string(),
            typ: "JWT".to_string(),
            kid: tokens.keys().kid().to_string(),
        };
        let claims = serde_json::json!({
            "sub": "u1", "ev": 1, "jti": "j", "iat": NOW, "exp": NOW + 900,
            "aud": "pasejo-app", "iss": "pasejo-api"
        });
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);
        let signing_key = SigningKey::<Sha256>::new(tokens.keys().private_key().clone());
        let signature: Signature = signing_key.sign(signing_input.as_bytes());
        let token = format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature.to_vec())
        );

        assert!(matches!(
            tokens.verify_at(&token, NOW),
            Err(Error::MissingClaim("tid"))
        ));
        Ok(())
    }

    #[test]
    fn rejects_malformed_tokens() -> Result<(), Error> {
        let tokens = session_tokens()?;
        assert!(matches!(
            tokens.verify_at("only.two", NOW),
            Err(Error::TokenFormat)
        ));
        assert!(matches!(
            tokens.verify_at("a.b.c.d", NOW),
            Err(Error::TokenFormat)
        ));
        assert!(matches!(
            tokens.verify_at("!!.e30.sig", NOW),
            Err(Error::Base64)
        ));
        Ok(())
    }
}
