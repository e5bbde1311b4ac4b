//! Refresh-secret rotation.
//!
//! The old secret is retired in the same conditional update that finds it, so two
//! concurrent refreshes with one secret cannot both succeed. Reused, expired and forged
//! secrets all get the same answer.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, error};

use super::{
    cookies::{rotated_cookies, REFRESH_COOKIE_NAME},
    state::AuthState,
    types::{RefreshRequest, TokenPairResponse},
    utils::{cookie_value, header_str, parse_body, request_id},
};
use crate::{
    api::{
        edge::csrf,
        error::{ApiError, ErrorEnvelope},
    },
    guard::ClientMode,
    store::{generate_refresh_secret, hash_refresh_secret},
};

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Cookie-mode session rotated"),
        (status = 200, description = "Bearer-mode token pair", body = TokenPairResponse),
        (status = 400, description = "Missing refresh secret", body = ErrorEnvelope),
        (status = 401, description = "Invalid or expired refresh", body = ErrorEnvelope),
        (status = 403, description = "CSRF or origin check failed", body = ErrorEnvelope)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: RefreshRequest = parse_body(&body)?;
    let mode = ClientMode::from_hints(header_str(&headers, "x-client"), request.client.as_deref());

    let presented = match mode {
        ClientMode::Web => {
            csrf::enforce_if_cookie_mode(&headers, state.config())?;
            cookie_value(&headers, REFRESH_COOKIE_NAME)
                .filter(|secret| !secret.is_empty())
                .ok_or_else(|| ApiError::unauthenticated("Missing refresh token."))?
        }
        ClientMode::Mobile => request
            .refresh
            .filter(|secret| !secret.trim().is_empty())
            .ok_or_else(|| ApiError::missing_field("Missing refresh token."))?,
    };

    let next_secret = generate_refresh_secret().map_err(|err| {
        error!("Failed to generate refresh secret: {err:#}");
        ApiError::internal()
    })?;

    let rotated = state
        .sessions()
        .rotate(
            &hash_refresh_secret(presented.trim()),
            hash_refresh_secret(&next_secret),
            state.config().refresh_ttl_seconds(),
        )
        .await
        .map_err(|err| {
            error!(request_id = %request_id(&headers), "Refresh rotation failed: {err:#}");
            ApiError::unauthenticated("Invalid or expired refresh.")
        })?;
    let Some(session) = rotated else {
        debug!("Refresh secret not active");
        return Err(ApiError::unauthenticated("Invalid or expired refresh."));
    };

    let epoch = state
        .cache()
        .seed_epoch(&session.tenant_id, &session.user_id)
        .await;
    let access = state
        .tokens()
        .issue(&session.user_id, &session.tenant_id, epoch)
        .map_err(|err| {
            error!("Failed to sign session token: {err}");
            ApiError::internal()
        })?;
    let ttl = state.tokens().ttl_seconds();

    match mode {
        ClientMode::Web => {
            // The CSRF cookie stays as it is; the client keeps echoing it.
            let cookies =
                rotated_cookies(state.config(), &access.token, ttl, &next_secret).map_err(|err| {
                    error!("Failed to build refresh cookies: {err:#}");
                    ApiError::internal()
                })?;
            Ok((StatusCode::NO_CONTENT, cookies).into_response())
        }
        ClientMode::Mobile => Ok((
            StatusCode::OK,
            Json(TokenPairResponse::bearer(access.token, ttl, next_secret, None)),
        )
            .into_response()),
    }
}
