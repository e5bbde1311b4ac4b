use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::api::handlers::auth::DEFAULT_UPSTREAM_PROVIDER;

pub const ARG_UPSTREAM_ISSUER: &str = "upstream-issuer";
pub const ARG_UPSTREAM_AUDIENCE: &str = "upstream-audience";
pub const ARG_UPSTREAM_JWKS_URL: &str = "upstream-jwks-url";
pub const ARG_UPSTREAM_JWT_SECRET: &str = "upstream-jwt-secret";
pub const ARG_UPSTREAM_PROVIDER: &str = "upstream-provider";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_UPSTREAM_ISSUER)
                .long(ARG_UPSTREAM_ISSUER)
                .help("Expected issuer of identity-provider tokens (unchecked when unset)")
                .env("PASEJO_UPSTREAM_ISSUER"),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_AUDIENCE)
                .long(ARG_UPSTREAM_AUDIENCE)
                .help("Expected audience of identity-provider tokens")
                .env("PASEJO_UPSTREAM_AUDIENCE")
                .default_value("authenticated"),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_JWKS_URL)
                .long(ARG_UPSTREAM_JWKS_URL)
                .help("Identity-provider JWKS URL for RS256/ES256 tokens")
                .env("PASEJO_UPSTREAM_JWKS_URL"),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_JWT_SECRET)
                .long(ARG_UPSTREAM_JWT_SECRET)
                .help("Shared secret for legacy HS256 identity-provider tokens")
                .env("PASEJO_UPSTREAM_JWT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_PROVIDER)
                .long(ARG_UPSTREAM_PROVIDER)
                .help("Provider name accepted by the exchange endpoint")
                .env("PASEJO_UPSTREAM_PROVIDER")
                .default_value(DEFAULT_UPSTREAM_PROVIDER),
        )
}

#[derive(Debug)]
pub struct Options {
    pub issuer: Option<String>,
    pub audience: String,
    pub jwks_url: Option<String>,
    pub jwt_secret: Option<SecretString>,
    pub provider: String,
}

impl Options {
    /// # Errors
    /// Returns an error when neither a JWKS URL nor a shared secret is configured.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let optional = |name: &str| {
            matches
                .get_one::<String>(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let jwks_url = optional(ARG_UPSTREAM_JWKS_URL);
        let jwt_secret = optional(ARG_UPSTREAM_JWT_SECRET).map(SecretString::from);
        if jwks_url.is_none() && jwt_secret.is_none() {
            return Err(anyhow!(
                "missing required argument: --{ARG_UPSTREAM_JWKS_URL} or --{ARG_UPSTREAM_JWT_SECRET}"
            ));
        }

        Ok(Self {
            issuer: optional(ARG_UPSTREAM_ISSUER),
            audience: optional(ARG_UPSTREAM_AUDIENCE)
                .context("missing required argument: --upstream-audience")?,
            jwks_url,
            jwt_secret,
            provider: optional(ARG_UPSTREAM_PROVIDER)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_PROVIDER.to_string()),
        })
    }
}
