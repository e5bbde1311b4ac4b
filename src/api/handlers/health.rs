use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

use super::auth::AuthState;
use crate::GIT_COMMIT_HASH;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    status: String,
    commit: String,
    name: String,
    version: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Dependencies {
    /// Durable store; required.
    database: bool,
    /// Volatile cache; optional, a failure only degrades caching.
    cache: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Readiness {
    status: String,
    dependencies: Dependencies,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Process is up", body = Health)
    ),
    tag = "health"
)]
// liveness only, no dependency is checked
pub async fn healthz() -> impl IntoResponse {
    let health = Health {
        status: "ok".to_string(),
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            debug!("X-App header: {:?}", x_app_header_value);

            let mut headers = HeaderMap::new();

            headers.insert("X-App", x_app_header_value);

            headers
        })
        .map_err(|err| {
            error!("Failed to parse X-App header: {}", err);
        });

    let headers = headers.unwrap_or_else(|()| HeaderMap::new());

    (StatusCode::OK, headers, Json(health))
}

#[utoipa::path(
    get,
    path = "/readyz",
    responses(
        (status = 200, description = "Database is reachable", body = Readiness),
        (status = 503, description = "Database is unreachable", body = Readiness)
    ),
    tag = "health"
)]
pub async fn readyz(Extension(state): Extension<Arc<AuthState>>) -> impl IntoResponse {
    let database = match state.readiness().ping().await {
        Ok(()) => true,
        Err(err) => {
            error!("Database ping failed: {err:#}");
            false
        }
    };
    let cache = match state.volatile().ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!("Cache ping failed: {err}");
            false
        }
    };

    let (status, text) = if database {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(Readiness {
            status: text.to_string(),
            dependencies: Dependencies { database, cache },
        }),
    )
}
