//! Logout. Every step after the CSRF check is best-effort and the answer is always 204,
//! even for an unreadable body.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    cookies::{clear_cookies, REFRESH_COOKIE_NAME},
    state::AuthState,
    types::LogoutRequest,
    utils::{cookie_value, header_str, parse_body, request_id},
};
use crate::{
    api::{
        edge::csrf,
        error::{ApiError, ErrorEnvelope},
    },
    guard::{extract_access_token, ClientMode},
    store::hash_refresh_secret,
};

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session cleared (also when it was already gone)"),
        (status = 403, description = "CSRF or origin check failed", body = ErrorEnvelope)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let request: LogoutRequest = parse_body(&body).unwrap_or_else(|_| {
        debug!(request_id = %request_id, "Unreadable logout body, logging out without it");
        LogoutRequest::default()
    });
    let mode = ClientMode::from_hints(header_str(&headers, "x-client"), request.client.as_deref());
    csrf::enforce_if_cookie_mode(&headers, state.config())?;

    // An expired or forged access token is fine here; there is nothing to block.
    let claims = extract_access_token(&headers).and_then(|token| {
        state
            .tokens()
            .verify(&token)
            .map_err(|err| debug!("Access token not blocked on logout: {err}"))
            .ok()
    });
    if let Some(claims) = &claims {
        if !state.cache().block(&claims.jti, claims.exp).await {
            warn!(request_id = %request_id, "Could not record token revocation on logout");
        }
    }

    let secret = match mode {
        ClientMode::Web => cookie_value(&headers, REFRESH_COOKIE_NAME),
        ClientMode::Mobile => request.refresh,
    }
    .map(|secret| secret.trim().to_string())
    .filter(|secret| !secret.is_empty());
    let secret_hash = secret.as_deref().map(hash_refresh_secret);

    if request.everywhere {
        let owner = claims.as_ref().map(|c| (c.sub.clone(), c.tid.clone()));
        sign_out_everywhere(&state, owner, secret_hash.as_deref(), &request_id).await;
    }

    if let Some(hash) = &secret_hash {
        match state.sessions().revoke(hash).await {
            Ok(true) => debug!("Refresh session revoked"),
            Ok(false) => debug!("Refresh session already inactive"),
            Err(err) => warn!(request_id = %request_id, "Failed to revoke refresh session: {err:#}"),
        }
    }

    let response = match mode {
        ClientMode::Web => (StatusCode::NO_CONTENT, clear_cookies(state.config())).into_response(),
        ClientMode::Mobile => StatusCode::NO_CONTENT.into_response(),
    };
    Ok(response)
}

/// Revoke every active refresh session of the caller in the current tenant. The caller is
/// identified by the access token, else by the refresh secret.
async fn sign_out_everywhere(
    state: &AuthState,
    owner: Option<(String, String)>,
    secret_hash: Option<&[u8]>,
    request_id: &str,
) {
    let owner = match (owner, secret_hash) {
        (Some(owner), _) => Some(owner),
        (None, Some(hash)) => match state.sessions().find_active(hash).await {
            Ok(session) => session.map(|s| (s.user_id, s.tenant_id)),
            Err(err) => {
                warn!(request_id, "Failed to look up refresh session: {err:#}");
                None
            }
        },
        (None, None) => None,
    };
    let Some((user_id, tenant_id)) = owner else {
        debug!("Sign-out everywhere skipped: caller unknown");
        return;
    };

    match state
        .sessions()
        .revoke_all_for_user(&user_id, Some(&tenant_id))
        .await
    {
        Ok(count) => info!(request_id, tenant_id = %tenant_id, revoked = count, "Signed out everywhere"),
        Err(err) => warn!(request_id, "Failed to revoke refresh sessions: {err:#}"),
    }
}
