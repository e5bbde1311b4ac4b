//! Cookie builders for cookie-mode (web) sessions.
//!
//! - `pasejo_sess`: `HttpOnly` session token, path `/`.
//! - `pasejo_refresh`: `HttpOnly` refresh secret, scoped to the refresh endpoint.
//! - `pasejo_csrf`: readable CSRF token the client echoes in `X-CSRF`.

use anyhow::{Context, Result};
use axum::http::{
    header::{InvalidHeaderValue, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};

use super::state::AuthConfig;

pub const SESSION_COOKIE_NAME: &str = "pasejo_sess";
pub const REFRESH_COOKIE_NAME: &str = "pasejo_refresh";
pub const CSRF_COOKIE_NAME: &str = "pasejo_csrf";
pub const CSRF_HEADER_NAME: &str = "x-csrf";

struct CookieSpec<'a> {
    name: &'a str,
    value: &'a str,
    path: &'a str,
    http_only: bool,
    max_age: i64,
}

fn build_cookie(config: &AuthConfig, spec: &CookieSpec<'_>) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={}; Path={}; SameSite=Lax; Max-Age={}",
        spec.name,
        spec.value,
        spec.path,
        spec.max_age.max(0)
    );
    if spec.http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    if let Some(domain) = config.cookie_domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn session_cookie(
    config: &AuthConfig,
    token: &str,
    ttl_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(
        config,
        &CookieSpec {
            name: SESSION_COOKIE_NAME,
            value: token,
            path: "/",
            http_only: true,
            max_age: ttl_seconds,
        },
    )
}

pub(super) fn refresh_cookie(
    config: &AuthConfig,
    secret: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let path = config.refresh_cookie_path();
    build_cookie(
        config,
        &CookieSpec {
            name: REFRESH_COOKIE_NAME,
            value: secret,
            path: &path,
            http_only: true,
            max_age: config.refresh_ttl_seconds(),
        },
    )
}

pub(super) fn csrf_cookie(config: &AuthConfig, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(
        config,
        &CookieSpec {
            name: CSRF_COOKIE_NAME,
            value: token,
            path: "/",
            http_only: false,
            max_age: config.refresh_ttl_seconds(),
        },
    )
}

/// Random value for the double-submit cookie. Not a credential.
pub(super) fn generate_csrf_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate CSRF token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Session, refresh and CSRF cookies for a fresh login.
pub(super) fn login_cookies(
    config: &AuthConfig,
    access_token: &str,
    access_ttl_seconds: i64,
    refresh_secret: &str,
) -> Result<HeaderMap> {
    let csrf = generate_csrf_token()?;
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        session_cookie(config, access_token, access_ttl_seconds)
            .context("invalid session cookie")?,
    );
    headers.append(
        SET_COOKIE,
        refresh_cookie(config, refresh_secret).context("invalid refresh cookie")?,
    );
    headers.append(
        SET_COOKIE,
        csrf_cookie(config, &csrf).context("invalid CSRF cookie")?,
    );
    Ok(headers)
}

/// Session and refresh cookies after a rotation. The CSRF cookie stays as it is.
pub(super) fn rotated_cookies(
    config: &AuthConfig,
    access_token: &str,
    access_ttl_seconds: i64,
    refresh_secret: &str,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        session_cookie(config, access_token, access_ttl_seconds)
            .context("invalid session cookie")?,
    );
    headers.append(
        SET_COOKIE,
        refresh_cookie(config, refresh_secret).context("invalid refresh cookie")?,
    );
    Ok(headers)
}

/// Expire all three cookies on the paths they were set with.
pub(super) fn clear_cookies(config: &AuthConfig) -> HeaderMap {
    let refresh_path = config.refresh_cookie_path();
    let specs = [
        (SESSION_COOKIE_NAME, "/", true),
        (REFRESH_COOKIE_NAME, refresh_path.as_str(), true),
        (CSRF_COOKIE_NAME, "/", false),
    ];

    let mut headers = HeaderMap::new();
    for (name, path, http_only) in specs {
        let cookie = build_cookie(
            config,
            &CookieSpec {
                name,
                value: "",
                path,
                http_only,
                max_age: 0,
            },
        );
        if let Ok(cookie) = cookie {
            headers.append(SET_COOKIE, cookie);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_cookies(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(ToString::to_string))
            .collect()
    }

    #[test]
    fn login_cookies_have_expected_attributes() -> Result<()> {
        let config = AuthConfig::new("/api/v1".to_string())
            .with_cookie_domain(Some(".example.com".to_string()));
        let cookies = set_cookies(&login_cookies(&config, "access", 900, "refresh")?);
        assert_eq!(cookies.len(), 3);

        let session = &cookies[0];
        assert!(session.starts_with("pasejo_sess=access; Path=/;"));
        assert!(session.contains("HttpOnly"));
        assert!(session.contains("Secure"));
        assert!(session.contains("SameSite=Lax"));
        assert!(session.contains("Max-Age=900"));
        assert!(session.contains("Domain=.example.com"));

        let refresh = &cookies[1];
        assert!(refresh.starts_with("pasejo_refresh=refresh; Path=/api/v1/auth/refresh;"));
        assert!(refresh.contains("HttpOnly"));
        assert!(refresh.contains("Max-Age=1209600"));

        let csrf = &cookies[2];
        assert!(csrf.starts_with("pasejo_csrf="));
        assert!(!csrf.contains("HttpOnly"));
        Ok(())
    }

    #[test]
    fn insecure_cookies_omit_secure_flag() -> Result<()> {
        let config = AuthConfig::new("/api/v1".to_string()).with_cookie_secure(false);
        let cookies = set_cookies(&rotated_cookies(&config, "a", 60, "r")?);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|cookie| !cookie.contains("Secure")));
        Ok(())
    }

    #[test]
    fn clear_cookies_expire_on_same_paths() {
        let config = AuthConfig::new("/api/v1".to_string());
        let cookies = set_cookies(&clear_cookies(&config));
        assert_eq!(
            cookies
                .iter()
                .map(|c| c.split(';').take(3).collect::<Vec<_>>().join(";"))
                .collect::<Vec<_>>(),
            vec![
                "pasejo_sess=; Path=/; SameSite=Lax".to_string(),
                "pasejo_refresh=; Path=/api/v1/auth/refresh; SameSite=Lax".to_string(),
                "pasejo_csrf=; Path=/; SameSite=Lax".to_string(),
            ]
        );
        assert!(cookies.iter().all(|cookie| cookie.contains("Max-Age=0")));
    }

    #[test]
    fn csrf_tokens_are_random() -> Result<()> {
        assert_ne!(generate_csrf_token()?, generate_csrf_token()?);
        Ok(())
    }
}
