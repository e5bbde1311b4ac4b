//! Login: trade an upstream identity token for a first-party session.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{
    issue::{login_response, open_session},
    state::AuthState,
    types::{ExchangeRequest, TenantChoiceResponse, TenantRef, TokenPairResponse},
    utils::{header_str, parse_body, request_id},
};
use crate::{
    api::error::{ApiError, ErrorEnvelope},
    guard::ClientMode,
    store::TenantChoice,
};

/// Non-standard success status telling the client to pick a tenant.
pub const CHOOSE_TENANT_STATUS: u16 = 209;

#[utoipa::path(
    post,
    path = "/api/v1/auth/exchange",
    request_body = ExchangeRequest,
    responses(
        (status = 204, description = "Cookie-mode session established"),
        (status = 200, description = "Bearer-mode token pair", body = TokenPairResponse),
        (status = 209, description = "Several tenants match; choose one", body = TenantChoiceResponse),
        (status = 400, description = "Missing provider token", body = ErrorEnvelope),
        (status = 401, description = "Invalid identity token", body = ErrorEnvelope),
        (status = 403, description = "No active tenant membership", body = ErrorEnvelope),
        (status = 422, description = "Malformed body or unsupported provider", body = ErrorEnvelope)
    ),
    tag = "auth"
)]
pub async fn exchange(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ExchangeRequest = parse_body(&body)?;

    let provider = request.provider.as_deref().map(str::trim).unwrap_or_default();
    if !provider.eq_ignore_ascii_case(state.config().upstream_provider()) {
        return Err(ApiError::validation("Unsupported provider."));
    }
    let Some(token) = request.token.as_deref().filter(|token| !token.trim().is_empty()) else {
        return Err(ApiError::missing_field("Missing provider token."));
    };

    let mode = ClientMode::from_hints(header_str(&headers, "x-client"), request.client.as_deref());

    let claims = state.upstream().verify(token.trim()).await.map_err(|err| {
        debug!("Upstream token rejected: {err}");
        ApiError::unauthenticated("Invalid identity token.")
    })?;

    let tenants = state
        .memberships()
        .active_tenants(&claims.sub)
        .await
        .map_err(|err| {
            error!(request_id = %request_id(&headers), "Failed to list memberships: {err:#}");
            ApiError::permission_denied("No active tenant membership.")
        })?;

    let Some(chosen) = choose_tenant(&tenants, request.tenant_hint.as_deref()) else {
        if tenants.is_empty() {
            return Err(ApiError::permission_denied("No active tenant membership."));
        }
        let status = StatusCode::from_u16(CHOOSE_TENANT_STATUS).unwrap_or(StatusCode::OK);
        return Ok((status, Json(TenantChoiceResponse { tenants })).into_response());
    };

    let session = open_session(&state, &claims.sub, &chosen.tenant_id, request.device).await?;
    info!(
        tenant_id = %chosen.tenant_id,
        client = mode.as_str(),
        "Session established"
    );

    let tenant = TenantRef {
        tenant_id: chosen.tenant_id.clone(),
        name: Some(chosen.name.clone()),
    };
    Ok(login_response(&state, mode, session, tenant))
}

/// A hint must match a tenant id or name. Without a hint, a single membership wins.
fn choose_tenant<'a>(tenants: &'a [TenantChoice], hint: Option<&str>) -> Option<&'a TenantChoice> {
    match hint.map(str::trim).filter(|hint| !hint.is_empty()) {
        Some(hint) => tenants
            .iter()
            .find(|tenant| tenant.tenant_id == hint || tenant.name == hint),
        None if tenants.len() == 1 => tenants.first(),
        None => None,
    }
}
