//! Strict allow-list CORS.
//!
//! Approved origins are echoed back with credentials allowed. Unknown origins get no CORS
//! headers at all, and their preflights are refused with 403.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
            ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
        },
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::handlers::auth::AuthState;

pub const PREFLIGHT_MAX_AGE_SECONDS: u32 = 600;
const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];
const ALLOWED_HEADERS: &str =
    "Authorization, Content-Type, Idempotency-Key, X-CSRF, X-Client, X-Request-ID";

pub async fn strict_cors(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let allowed = origin
        .as_deref()
        .filter(|origin| state.config().is_allowed_origin(origin));

    if request.method() == Method::OPTIONS {
        return preflight(allowed, request.headers());
    }

    let mut response = next.run(request).await;
    if let Some(origin) = allowed {
        apply_cors_headers(response.headers_mut(), origin);
    }
    response
}

fn preflight(origin: Option<&str>, headers: &HeaderMap) -> Response {
    let Some(origin) = origin else {
        return (StatusCode::FORBIDDEN, "CORS preflight blocked").into_response();
    };

    let requested = headers
        .get(ACCESS_CONTROL_REQUEST_METHOD)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !ALLOWED_METHODS.contains(&requested) {
        return (StatusCode::FORBIDDEN, "Method not allowed by CORS").into_response();
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    apply_cors_headers(headers, origin);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(PREFLIGHT_MAX_AGE_SECONDS));
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}
