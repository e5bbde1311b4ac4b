use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

use crate::cache::{StalenessPolicy, DEFAULT_EPOCH_TTL_SECONDS, DEFAULT_PERMSET_TTL_SECONDS};

pub const ARG_SIGNING_KEY_PATH: &str = "signing-key-path";
pub const ARG_ISSUER: &str = "issuer";
pub const ARG_AUDIENCE: &str = "audience";
pub const ARG_ACCESS_TTL_SECONDS: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL_SECONDS: &str = "refresh-ttl-seconds";
pub const ARG_PERMSET_TTL_SECONDS: &str = "permset-ttl-seconds";
pub const ARG_EPOCH_CACHE_TTL_SECONDS: &str = "epoch-cache-ttl-seconds";
pub const ARG_STALENESS_POLICY: &str = "staleness-policy";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_cache_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SIGNING_KEY_PATH)
                .long(ARG_SIGNING_KEY_PATH)
                .help("RSA private key that signs session tokens (PKCS#8 or PKCS#1, PEM or DER)")
                .env("PASEJO_SIGNING_KEY_PATH")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer claim of session tokens")
                .env("PASEJO_ISSUER")
                .default_value("pasejo-api"),
        )
        .arg(
            Arg::new(ARG_AUDIENCE)
                .long(ARG_AUDIENCE)
                .help("Audience claim of session tokens")
                .env("PASEJO_AUDIENCE")
                .default_value("pasejo-app"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL_SECONDS)
                .long(ARG_ACCESS_TTL_SECONDS)
                .help("Access token lifetime in seconds")
                .env("PASEJO_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL_SECONDS)
                .long(ARG_REFRESH_TTL_SECONDS)
                .help("Refresh session lifetime in seconds")
                .env("PASEJO_REFRESH_TTL_SECONDS")
                .default_value("1209600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

fn with_cache_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PERMSET_TTL_SECONDS)
                .long(ARG_PERMSET_TTL_SECONDS)
                .help("How long a resolved permission set stays cached, in seconds")
                .env("PASEJO_PERMSET_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_EPOCH_CACHE_TTL_SECONDS)
                .long(ARG_EPOCH_CACHE_TTL_SECONDS)
                .help("How long an epoch read from the database stays cached, in seconds")
                .env("PASEJO_EPOCH_CACHE_TTL_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_STALENESS_POLICY)
                .long(ARG_STALENESS_POLICY)
                .help("What to do when the epoch cannot be read")
                .env("PASEJO_STALENESS_POLICY")
                .default_value("fail-open")
                .value_parser(["fail-open", "fail-closed"]),
        )
}

#[derive(Debug)]
pub struct Options {
    pub signing_key_path: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub permset_ttl_seconds: u64,
    pub epoch_cache_ttl_seconds: u64,
    pub staleness_policy: StalenessPolicy,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing or the staleness policy is unknown.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let string = |name: &str| -> Result<String> {
            matches
                .get_one::<String>(name)
                .cloned()
                .with_context(|| format!("missing required argument: --{name}"))
        };
        let staleness_policy = string(ARG_STALENESS_POLICY)?.parse::<StalenessPolicy>()?;

        Ok(Self {
            signing_key_path: string(ARG_SIGNING_KEY_PATH)?,
            issuer: string(ARG_ISSUER)?,
            audience: string(ARG_AUDIENCE)?,
            access_ttl_seconds: matches
                .get_one::<i64>(ARG_ACCESS_TTL_SECONDS)
                .copied()
                .unwrap_or(900),
            refresh_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TTL_SECONDS)
                .copied()
                .unwrap_or(1_209_600),
            permset_ttl_seconds: matches
                .get_one::<u64>(ARG_PERMSET_TTL_SECONDS)
                .copied()
                .unwrap_or(DEFAULT_PERMSET_TTL_SECONDS),
            epoch_cache_ttl_seconds: matches
                .get_one::<u64>(ARG_EPOCH_CACHE_TTL_SECONDS)
                .copied()
                .unwrap_or(DEFAULT_EPOCH_TTL_SECONDS),
            staleness_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        temp_env::with_vars(
            [
                ("PASEJO_SIGNING_KEY_PATH", Some("/etc/pasejo/signing.pem")),
                ("PASEJO_STALENESS_POLICY", None),
                ("PASEJO_ACCESS_TTL_SECONDS", None),
            ],
            || {
                let matches = with_args(Command::new("pasejo")).get_matches_from(["pasejo"]);
                let options = Options::parse(&matches)?;
                assert_eq!(options.signing_key_path, "/etc/pasejo/signing.pem");
                assert_eq!(options.issuer, "pasejo-api");
                assert_eq!(options.audience, "pasejo-app");
                assert_eq!(options.access_ttl_seconds, 900);
                assert_eq!(options.refresh_ttl_seconds, 1_209_600);
                assert_eq!(options.permset_ttl_seconds, 900);
                assert_eq!(options.epoch_cache_ttl_seconds, 30);
                assert_eq!(options.staleness_policy, StalenessPolicy::FailOpen);
                Ok(())
            },
        )
    }

    #[test]
    fn staleness_policy_from_env() -> Result<()> {
        temp_env::with_vars(
            [
                ("PASEJO_SIGNING_KEY_PATH", Some("key.pem")),
                ("PASEJO_STALENESS_POLICY", Some("fail-closed")),
            ],
            || {
                let matches = with_args(Command::new("pasejo")).get_matches_from(["pasejo"]);
                assert_eq!(Options::parse(&matches)?.staleness_policy, StalenessPolicy::FailClosed);
                Ok(())
            },
        )
    }

    #[test]
    fn signing_key_is_required() {
        temp_env::with_var("PASEJO_SIGNING_KEY_PATH", None::<&str>, || {
            let result = with_args(Command::new("pasejo")).try_get_matches_from(["pasejo"]);
            assert!(result.is_err());
        });
    }
}
