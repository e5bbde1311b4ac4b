use axum::{
    extract::Extension,
    http::header::CACHE_CONTROL,
    response::{IntoResponse, Json},
};
use std::sync::Arc;

use super::auth::AuthState;
use crate::token::Jwks;

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public key that verifies session tokens", body = Jwks)
    ),
    tag = "keys"
)]
pub async fn jwks(Extension(state): Extension<Arc<AuthState>>) -> impl IntoResponse {
    // Verifiers may cache the set; rotation changes the kid.
    (
        [(CACHE_CONTROL, "public, max-age=300")],
        Json(state.tokens().keys().jwks()),
    )
}
