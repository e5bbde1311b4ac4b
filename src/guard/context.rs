use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use utoipa::ToSchema;

/// How the client carries its credentials, decided once per request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Browser with cookies; state-changing calls need CSRF proof.
    #[default]
    Web,
    /// Bearer tokens in JSON bodies and Authorization headers.
    Mobile,
}

impl ClientMode {
    /// Session endpoints: `X-Client` header, else the body's `client`, else web.
    #[must_use]
    pub fn from_hints(header: Option<&str>, body: Option<&str>) -> Self {
        let hint = header
            .filter(|value| !value.trim().is_empty())
            .or(body)
            .unwrap_or_default();
        if hint.trim().eq_ignore_ascii_case("mobile") {
            Self::Mobile
        } else {
            Self::Web
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }
}

/// Allow-listed attribute keys copied from membership data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Abac {
    pub rooms: Vec<Value>,
    pub guardian_of: Vec<Value>,
}

impl Abac {
    /// Only list values are copied; every other key is dropped.
    #[must_use]
    pub fn from_attrs(attrs: &Map<String, Value>) -> Self {
        let list = |key: &str| match attrs.get(key) {
            Some(Value::Array(values)) => values.clone(),
            _ => Vec::new(),
        };
        Self {
            rooms: list("rooms"),
            guardian_of: list("guardianOf"),
        }
    }
}

/// Output of the guard chain, owned by one request.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub request_id: String,
    pub client_mode: ClientMode,
    pub tenant_id: String,
    pub user_id: String,
    pub roles: Vec<String>,
    pub permissions: BTreeSet<String>,
    pub abac: Abac,
    pub epoch: i64,
    pub jti: String,
}
