//! Tenant switch: mint a fresh session for another tenant of the same user.
//!
//! An `Idempotency-Key` header turns retried clicks into replays. The first request
//! reserves `idem:switch:{user}:{key}` and stores its response there; repeats inside the
//! window get the stored response instead of another session.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use super::{
    issue::{cookie_response, open_session, token_pair},
    state::{AuthState, IDEMPOTENCY_TTL_SECONDS},
    types::{SwitchRequest, TenantRef, TokenPairResponse},
    utils::{header_str, parse_body, request_id},
};
use crate::{
    api::{
        edge::csrf,
        error::{ApiError, ErrorEnvelope},
    },
    guard::{ensure_not_revoked, extract_access_token, verify_session, ClientMode},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[must_use]
pub fn idempotency_key(user_id: &str, key: &str) -> String {
    format!("idem:switch:{user_id}:{key}")
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/switch",
    request_body = SwitchRequest,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Replays the first response for 120 seconds")
    ),
    responses(
        (status = 204, description = "Cookie-mode session moved to the target tenant"),
        (status = 200, description = "Bearer-mode token pair", body = TokenPairResponse),
        (status = 400, description = "Missing tenantId", body = ErrorEnvelope),
        (status = 401, description = "Invalid, expired or revoked session", body = ErrorEnvelope),
        (status = 403, description = "Not a member of the target tenant, or CSRF failure", body = ErrorEnvelope)
    ),
    tag = "auth"
)]
pub async fn switch(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: SwitchRequest = parse_body(&body)?;
    let Some(target) = request
        .tenant_id
        .as_deref()
        .map(str::trim)
        .filter(|tenant_id| !tenant_id.is_empty())
    else {
        return Err(ApiError::missing_field("Missing tenantId."));
    };
    let mode = ClientMode::from_hints(header_str(&headers, "x-client"), request.client.as_deref());
    // Cookie credentials are checked whatever client mode the caller declares.
    csrf::enforce_if_cookie_mode(&headers, state.config())?;

    let token = extract_access_token(&headers)
        .ok_or_else(|| ApiError::unauthenticated("Invalid or expired session."))?;
    let claims = verify_session(&state, &token)?;
    ensure_not_revoked(&state, &claims.jti, &request_id(&headers)).await?;
    let user_id = claims.sub;

    let not_member = || ApiError::permission_denied("You are not a member of the target tenant.");
    match state.memberships().membership(target, &user_id).await {
        Ok(Some(membership)) if membership.is_active() => {}
        Ok(_) => return Err(not_member()),
        Err(err) => {
            error!(request_id = %request_id(&headers), "Membership lookup failed: {err:#}");
            return Err(not_member());
        }
    }

    let reservation = match header_str(&headers, IDEMPOTENCY_KEY_HEADER) {
        Some(key) => match reserve(&state, &idempotency_key(&user_id, key), target).await {
            Reservation::Replay(stored) => return Ok(replay(mode, stored)),
            Reservation::Reserved(key) => Some(key),
            Reservation::Skipped => None,
        },
        None => None,
    };

    let session = match open_session(&state, &user_id, target, None).await {
        Ok(session) => session,
        Err(err) => {
            if let Some(key) = &reservation {
                release(&state, key).await;
            }
            return Err(err);
        }
    };
    info!(tenant_id = %target, client = mode.as_str(), "Tenant switched");

    let name = state
        .memberships()
        .tenant_name(target)
        .await
        .unwrap_or_else(|err| {
            warn!("Tenant name lookup failed: {err:#}");
            None
        });
    let tenant = TenantRef {
        tenant_id: target.to_string(),
        name,
    };

    let response = match mode {
        ClientMode::Web => {
            let response = cookie_response(&state, &session);
            if let Some(key) = &reservation {
                remember(&state, key, json!({ "tenant": tenant })).await;
            }
            response
        }
        ClientMode::Mobile => {
            let pair = token_pair(&state, session, Some(tenant));
            if let Some(key) = &reservation {
                match serde_json::to_value(&pair) {
                    Ok(value) => remember(&state, key, value).await,
                    Err(err) => warn!("Failed to encode switch response for replay: {err}"),
                }
            }
            (StatusCode::OK, Json(pair)).into_response()
        }
    };
    Ok(response)
}

enum Reservation {
    Reserved(String),
    Replay(Value),
    /// The volatile store is down; the switch proceeds without idempotency.
    Skipped,
}

async fn reserve(state: &AuthState, key: &str, target: &str) -> Reservation {
    let ttl = Some(Duration::from_secs(IDEMPOTENCY_TTL_SECONDS));
    // Stands in for the response until the first request finishes.
    let placeholder = json!({ "tenantId": target, "tokenType": "Bearer" });

    match state
        .volatile()
        .set_if_absent(key, placeholder.to_string(), ttl)
        .await
    {
        Ok(true) => Reservation::Reserved(key.to_string()),
        Ok(false) => match state.volatile().get(key).await {
            Ok(Some(stored)) => {
                Reservation::Replay(serde_json::from_str(&stored).unwrap_or(placeholder))
            }
            // Expired between the two calls.
            Ok(None) => Reservation::Skipped,
            Err(err) => {
                warn!("Idempotency lookup failed: {err}");
                Reservation::Skipped
            }
        },
        Err(err) => {
            warn!("Idempotency reservation failed: {err}");
            Reservation::Skipped
        }
    }
}

async fn remember(state: &AuthState, key: &str, response: Value) {
    let ttl = Some(Duration::from_secs(IDEMPOTENCY_TTL_SECONDS));
    if let Err(err) = state.volatile().set(key, response.to_string(), ttl).await {
        warn!("Failed to store switch response for replay: {err}");
    }
}

async fn release(state: &AuthState, key: &str) {
    if let Err(err) = state.volatile().delete(key).await {
        warn!("Failed to release idempotency key: {err}");
    }
}

/// Cookie clients already hold the cookies from the first response.
fn replay(mode: ClientMode, stored: Value) -> Response {
    match mode {
        ClientMode::Web => StatusCode::NO_CONTENT.into_response(),
        ClientMode::Mobile => (StatusCode::OK, Json(stored)).into_response(),
    }
}
