//! Tenant-scoped authorization context of the caller.

use axum::{extract::Extension, http::HeaderMap, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

use super::auth::AuthState;
use crate::{
    api::error::{ApiError, ErrorEnvelope},
    guard::{authorize, Abac},
};

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    pub tenant_id: String,
    pub name: Option<String>,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ContextMeta {
    pub ev: i64,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct MeContextResponse {
    pub tenant: TenantInfo,
    pub user: UserInfo,
    pub roles: Vec<String>,
    /// Sorted.
    pub permissions: Vec<String>,
    pub abac: Abac,
    pub meta: ContextMeta,
}

#[utoipa::path(
    get,
    path = "/api/v1/me/context",
    responses(
        (status = 200, description = "Authorization context", body = MeContextResponse),
        (status = 401, description = "Missing, invalid, revoked or outdated session", body = ErrorEnvelope),
        (status = 403, description = "No active membership in the session tenant", body = ErrorEnvelope)
    ),
    security(("bearer" = [])),
    tag = "me"
)]
pub async fn context(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
) -> Result<Json<MeContextResponse>, ApiError> {
    // The tenant always comes from the session, never from the request.
    let ctx = authorize(&state, &headers).await?;

    let name = state
        .memberships()
        .tenant_name(&ctx.tenant_id)
        .await
        .unwrap_or_else(|err| {
            warn!(request_id = %ctx.request_id, "Tenant name lookup failed: {err:#}");
            None
        });

    Ok(Json(MeContextResponse {
        tenant: TenantInfo {
            tenant_id: ctx.tenant_id,
            name,
        },
        user: UserInfo {
            user_id: ctx.user_id,
        },
        roles: ctx.roles,
        permissions: ctx.permissions.into_iter().collect(),
        abac: ctx.abac,
        meta: ContextMeta { ev: ctx.epoch },
    }))
}
