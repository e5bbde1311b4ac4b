//! Authorization guard chain.
//!
//! Flow Overview: extract the session token (bearer header first, then the session
//! cookie), verify it, reject revoked token ids, reject tokens whose epoch is behind the
//! current one, then resolve the membership and its permission set. The first failing
//! stage ends the chain; there is no retry here.

mod context;

pub use context::{Abac, AuthContext, ClientMode};

use axum::http::HeaderMap;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    api::{
        edge::csrf::has_session_cookie,
        error::ApiError,
        handlers::auth::{
            cookies::SESSION_COOKIE_NAME,
            utils::{cookie_value, extract_bearer_token, request_id},
            AuthState,
        },
    },
    cache::{Lookup, RevocationStatus, StalenessPolicy},
    token::{self, SessionClaims},
};

const NO_TENANT_ACCESS: &str = "You do not have access to this tenant.";

/// Bearer header first, then the session cookie.
pub(crate) fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    extract_bearer_token(headers)
        .or_else(|| cookie_value(headers, SESSION_COOKIE_NAME).filter(|v| !v.is_empty()))
}

/// Guard chain mode: cookie mode when a session or refresh cookie is present.
#[must_use]
pub fn detect_client_mode(headers: &HeaderMap) -> ClientMode {
    if has_session_cookie(headers) {
        ClientMode::Web
    } else {
        ClientMode::Mobile
    }
}

/// Verify a session token, collapsing every failure to `UNAUTHENTICATED`.
///
/// # Errors
/// `UNAUTHENTICATED` with a generic message; the cause is only logged.
pub fn verify_session(state: &AuthState, token: &str) -> Result<SessionClaims, ApiError> {
    state.tokens().verify(token).map_err(|err| {
        debug!("Session token rejected: {err}");
        match err {
            token::Error::MissingClaim(_) => ApiError::unauthenticated("Malformed session."),
            _ => ApiError::unauthenticated("Invalid or expired session."),
        }
    })
}

/// Reject a token whose `jti` is on the blocklist. An unreachable blocklist lets it through.
///
/// # Errors
/// `UNAUTHENTICATED` when the token was revoked.
pub async fn ensure_not_revoked(
    state: &AuthState,
    jti: &str,
    request_id: &str,
) -> Result<(), ApiError> {
    match state.cache().revocation_status(jti).await {
        RevocationStatus::Revoked => Err(ApiError::unauthenticated(
            "Session has been revoked. Please sign in again.",
        )),
        RevocationStatus::Clear => Ok(()),
        RevocationStatus::Unavailable => {
            warn!(request_id = %request_id, "Revocation check unavailable, treating token as not revoked");
            Ok(())
        }
    }
}

/// Resolve a request to an authorization context.
///
/// # Errors
/// `UNAUTHENTICATED`, `EV_OUTDATED` or `PERMISSION_DENIED` from the first failing stage.
pub async fn authorize(state: &AuthState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let request_id = request_id(headers);
    let client_mode = detect_client_mode(headers);

    let token = extract_access_token(headers)
        .ok_or_else(|| ApiError::unauthenticated("Missing access token."))?;
    let claims = verify_session(state, &token)?;

    ensure_not_revoked(state, &claims.jti, &request_id).await?;

    match state.cache().epoch(&claims.tid, &claims.sub).await {
        Lookup::Hit(current) if current > claims.ev => return Err(ApiError::ev_outdated()),
        Lookup::Hit(_) | Lookup::Miss => {}
        Lookup::Unavailable => match state.config().staleness_policy() {
            StalenessPolicy::FailOpen => {
                warn!(request_id = %request_id, "Epoch check unavailable, treating token as fresh");
            }
            StalenessPolicy::FailClosed => {
                warn!(request_id = %request_id, "Epoch check unavailable, asking client to refresh");
                return Err(ApiError::ev_outdated());
            }
        },
    }

    let membership = match state.memberships().membership(&claims.tid, &claims.sub).await {
        Ok(Some(membership)) if membership.is_active() => membership,
        Ok(_) => return Err(ApiError::permission_denied(NO_TENANT_ACCESS)),
        Err(err) => {
            error!(request_id = %request_id, "Membership lookup failed: {err:#}");
            return Err(ApiError::permission_denied(NO_TENANT_ACCESS));
        }
    };

    let permissions = state
        .cache()
        .permissions(&claims.tid, &claims.sub, &membership.roles, state.roles())
        .await
        .map_err(|err| {
            error!(request_id = %request_id, "Permission resolution failed: {err:#}");
            ApiError::permission_denied(NO_TENANT_ACCESS)
        })?;

    Ok(AuthContext {
        request_id,
        client_mode,
        abac: Abac::from_attrs(&membership.attrs),
        tenant_id: claims.tid,
        user_id: claims.sub,
        roles: membership.roles,
        permissions,
        epoch: claims.ev,
        jti: claims.jti,
    })
}

/// Require every permission in `required`.
///
/// # Errors
/// `PERMISSION_DENIED` with the sorted list of missing permissions.
pub fn require_permissions(ctx: &AuthContext, required: &[&str]) -> Result<(), ApiError> {
    let mut missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|permission| !ctx.permissions.contains(*permission))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    missing.dedup();
    Err(
        ApiError::permission_denied("You do not have permission to perform this action.")
            .with_details(json!({ "missing": missing })),
    )
}
