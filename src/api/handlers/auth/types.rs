//! Request/response types for the session endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::store::TenantChoice;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub provider: Option<String>,
    pub token: Option<String>,
    pub tenant_hint: Option<String>,
    pub client: Option<String>,
    /// Free-form device metadata stored with the refresh session.
    pub device: Option<Value>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct RefreshRequest {
    pub client: Option<String>,
    pub refresh: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub tenant_id: Option<String>,
    pub client: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct LogoutRequest {
    pub client: Option<String>,
    pub refresh: Option<String>,
    /// Also revoke every other refresh session of the user in this tenant.
    #[serde(default)]
    pub everywhere: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantRef {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Bearer-mode token pair.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TokenPairResponse {
    pub token_type: String,
    pub access: String,
    pub expires_in: i64,
    pub refresh: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantRef>,
}

impl TokenPairResponse {
    #[must_use]
    pub fn bearer(access: String, expires_in: i64, refresh: String, tenant: Option<TenantRef>) -> Self {
        Self {
            token_type: "Bearer".to_string(),
            access,
            expires_in,
            refresh,
            tenant,
        }
    }
}

/// Returned with status 209 when the user must pick a tenant.
#[derive(ToSchema, Serialize, Debug)]
pub struct TenantChoiceResponse {
    pub tenants: Vec<TenantChoice>,
}
