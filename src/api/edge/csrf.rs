//! Double-submit CSRF defense for cookie-mode, state-changing requests.

use axum::http::{
    header::{ORIGIN, REFERER},
    HeaderMap,
};
use serde_json::json;
use url::Url;

use crate::api::{
    error::{ApiError, ErrorCode},
    handlers::auth::{
        cookies::{CSRF_COOKIE_NAME, CSRF_HEADER_NAME, REFRESH_COOKIE_NAME, SESSION_COOKIE_NAME},
        utils::cookie_value,
        AuthConfig,
    },
};

/// A request is in cookie mode when it carries the session or the refresh cookie.
#[must_use]
pub fn has_session_cookie(headers: &HeaderMap) -> bool {
    cookie_value(headers, SESSION_COOKIE_NAME).is_some()
        || cookie_value(headers, REFRESH_COOKIE_NAME).is_some()
}

/// Enforce the CSRF checks when the request is in cookie mode.
///
/// # Errors
/// `ORIGIN_MISMATCH` or `CSRF_FAILED` when a check fails.
pub fn enforce_if_cookie_mode(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
    if has_session_cookie(headers) {
        enforce(headers, config)
    } else {
        Ok(())
    }
}

/// Origin (or Referer) must be allow-listed and the `X-CSRF` header must equal the CSRF cookie.
///
/// # Errors
/// `ORIGIN_MISMATCH` or `CSRF_FAILED` when a check fails.
pub fn enforce(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
    check_origin(headers, config)?;
    check_double_submit(headers)
}

fn check_origin(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            headers
                .get(REFERER)
                .and_then(|value| value.to_str().ok())
                .map(referer_origin)
        });

    let Some(origin) = origin else {
        return Err(ApiError::new(
            ErrorCode::OriginMismatch,
            "Missing Origin/Referer for state-changing request.",
        ));
    };

    if config.is_allowed_origin(&origin) {
        Ok(())
    } else {
        Err(
            ApiError::new(ErrorCode::OriginMismatch, "Origin not allowed.")
                .with_details(json!({ "origin": origin })),
        )
    }
}

/// `scheme://host[:port]` of a Referer; unparsable values are compared as given.
fn referer_origin(referer: &str) -> String {
    Url::parse(referer.trim()).map_or_else(
        |_| referer.trim().to_string(),
        |url| url.origin().ascii_serialization(),
    )
}

fn check_double_submit(headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    let cookie = cookie_value(headers, CSRF_COOKIE_NAME).filter(|value| !value.is_empty());

    match (header, cookie) {
        (Some(header), Some(cookie)) if header == cookie => Ok(()),
        (Some(_), Some(_)) => Err(ApiError::new(ErrorCode::CsrfFailed, "Invalid CSRF token.")),
        (header, cookie) => Err(
            ApiError::new(ErrorCode::CsrfFailed, "Missing CSRF token.").with_details(json!({
                "header": header.is_some(),
                "cookie": cookie.is_some(),
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> AuthConfig {
        AuthConfig::new("/api/v1".to_string())
            .with_allowed_origins(vec!["https://app.example.com".to_string()])
    }

    fn cookie_headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(cookie).unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        headers
    }

    fn code(result: Result<(), ApiError>) -> Option<ErrorCode> {
        result.err().map(|err| err.code)
    }

    #[test]
    fn bearer_requests_skip_csrf() {
        let headers = HeaderMap::new();
        assert!(enforce_if_cookie_mode(&headers, &config()).is_ok());
    }

    #[test]
    fn matching_token_and_origin_pass() {
        let mut headers = cookie_headers("pasejo_sess=abc; pasejo_csrf=tok");
        headers.insert(ORIGIN, HeaderValue::from_static("https://app.example.com"));
        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("tok"));
        assert!(enforce_if_cookie_mode(&headers, &config()).is_ok());
    }

    #[test]
    fn disallowed_origin_wins_over_valid_token() {
        let mut headers = cookie_headers("pasejo_sess=abc; pasejo_csrf=tok");
        headers.insert(ORIGIN, HeaderValue::from_static("https://evil.example.com"));
        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("tok"));
        let err = enforce_if_cookie_mode(&headers, &config()).err();
        assert_eq!(err.as_ref().map(|e| e.code), Some(ErrorCode::OriginMismatch));
        assert_eq!(
            err.and_then(|e| e.details).map(|d| d["origin"].clone()),
            Some(json!("https://evil.example.com"))
        );
    }

    #[test]
    fn referer_is_used_without_origin() {
        let mut headers = cookie_headers("pasejo_refresh=r; pasejo_csrf=tok");
        headers.insert(
            REFERER,
            HeaderValue::from_static("https://app.example.com/settings?tab=1"),
        );
        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("tok"));
        assert!(enforce_if_cookie_mode(&headers, &config()).is_ok());

        headers.insert(REFERER, HeaderValue::from_static("https://other.example.com/"));
        assert_eq!(
            code(enforce_if_cookie_mode(&headers, &config())),
            Some(ErrorCode::OriginMismatch)
        );
    }

    #[test]
    fn missing_origin_and_referer_is_rejected() {
        let headers = cookie_headers("pasejo_sess=abc; pasejo_csrf=tok");
        let err = enforce(&headers, &config()).err();
        assert_eq!(
            err.map(|e| e.message),
            Some("Missing Origin/Referer for state-changing request.".to_string())
        );
    }

    #[test]
    fn mismatched_or_missing_token_fails() {
        let mut headers = cookie_headers("pasejo_sess=abc; pasejo_csrf=tok");
        headers.insert(ORIGIN, HeaderValue::from_static("https://app.example.com"));
        assert_eq!(code(enforce(&headers, &config())), Some(ErrorCode::CsrfFailed));

        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("other"));
        let err = enforce(&headers, &config()).err();
        assert_eq!(err.map(|e| e.message), Some("Invalid CSRF token.".to_string()));
    }
}
