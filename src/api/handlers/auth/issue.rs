//! Session minting shared by exchange and switch.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::error;

use super::{
    cookies::login_cookies,
    state::AuthState,
    types::{TenantRef, TokenPairResponse},
};
use crate::{
    api::error::ApiError,
    guard::ClientMode,
    store::{generate_refresh_secret, hash_refresh_secret, NewRefreshSession},
    token::IssuedToken,
};

pub(super) struct OpenedSession {
    pub(super) access: IssuedToken,
    pub(super) refresh: String,
}

/// Seed the epoch, mint a session token and persist a new refresh session.
pub(super) async fn open_session(
    state: &AuthState,
    user_id: &str,
    tenant_id: &str,
    device: Option<Value>,
) -> Result<OpenedSession, ApiError> {
    let epoch = state.cache().seed_epoch(tenant_id, user_id).await;
    let access = state
        .tokens()
        .issue(user_id, tenant_id, epoch)
        .map_err(|err| {
            error!("Failed to sign session token: {err}");
            ApiError::internal()
        })?;

    let refresh = generate_refresh_secret().map_err(|err| {
        error!("Failed to generate refresh secret: {err:#}");
        ApiError::internal()
    })?;
    state
        .sessions()
        .create(NewRefreshSession {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            token_hash: hash_refresh_secret(&refresh),
            ttl_seconds: state.config().refresh_ttl_seconds(),
            device,
        })
        .await
        .map_err(|err| {
            error!("Failed to persist refresh session: {err:#}");
            ApiError::internal()
        })?;

    Ok(OpenedSession { access, refresh })
}

pub(super) fn token_pair(
    state: &AuthState,
    session: OpenedSession,
    tenant: Option<TenantRef>,
) -> TokenPairResponse {
    TokenPairResponse::bearer(
        session.access.token,
        state.tokens().ttl_seconds(),
        session.refresh,
        tenant,
    )
}

/// 204 with the three login cookies.
pub(super) fn cookie_response(state: &AuthState, session: &OpenedSession) -> Response {
    match login_cookies(
        state.config(),
        &session.access.token,
        state.tokens().ttl_seconds(),
        &session.refresh,
    ) {
        Ok(cookies) => (StatusCode::NO_CONTENT, cookies).into_response(),
        Err(err) => {
            error!("Failed to build login cookies: {err:#}");
            ApiError::internal().into_response()
        }
    }
}

pub(super) fn login_response(
    state: &AuthState,
    mode: ClientMode,
    session: OpenedSession,
    tenant: TenantRef,
) -> Response {
    match mode {
        ClientMode::Web => cookie_response(state, &session),
        ClientMode::Mobile => (
            StatusCode::OK,
            Json(token_pair(state, session, Some(tenant))),
        )
            .into_response(),
    }
}
