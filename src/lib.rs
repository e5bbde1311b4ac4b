//! # Pasejo (multi-tenant authorization gateway)
//!
//! `pasejo` sits in front of business APIs. It trades an upstream identity-provider
//! token for a first-party session and checks every protected request against that
//! session. It also runs the session lifecycle: rotation, revocation and staleness.
//!
//! ## Sessions
//!
//! A session is a short-lived RS256 access token plus a long-lived refresh secret.
//! Access tokens are never persisted. Refresh secrets are stored only as SHA-256
//! digests and rotate on every use: a secret that was already rotated no longer
//! resolves, so a replayed secret is indistinguishable from a forged one.
//!
//! Browsers get the pair as cookies (`web` client mode) and must echo a CSRF cookie in
//! the `X-CSRF` header on state-changing calls. Native clients get JSON and send a
//! bearer token (`mobile` client mode).
//!
//! ## Guard Chain
//!
//! Flow Overview: extract credential, verify signature and claims, check the
//! revocation blocklist, compare the authorization epoch, resolve membership and the
//! permission set (cache first, single-flight on a miss), copy the attribute hints.
//!
//! Revocation and epoch checks are availability-biased: when the caches are down the
//! request proceeds and a warning is logged. Membership and refresh lookups are not:
//! a failing database denies the request.

pub mod api;
pub mod cache;
pub mod cli;
pub mod guard;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
