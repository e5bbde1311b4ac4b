use clap::{Arg, ArgMatches, Command};

use crate::api::{
    edge::RateSpec,
    handlers::auth::{DEFAULT_RATE_LIMIT_IP, DEFAULT_RATE_LIMIT_USER},
};

pub const ARG_ALLOWED_ORIGINS: &str = "allowed-origins";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_RATE_LIMIT_IP: &str = "rate-limit-ip";
pub const ARG_RATE_LIMIT_USER: &str = "rate-limit-user";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALLOWED_ORIGINS)
                .long(ARG_ALLOWED_ORIGINS)
                .help("Comma separated browser origins allowed for CORS and CSRF checks")
                .env("PASEJO_ALLOWED_ORIGINS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Domain attribute for session cookies")
                .env("PASEJO_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark session cookies Secure")
                .env("PASEJO_COOKIE_SECURE")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_IP)
                .long(ARG_RATE_LIMIT_IP)
                .help("Auth requests allowed per client IP, as count/unit with unit s, m, h or d")
                .env("PASEJO_RATE_LIMIT_IP")
                .default_value("20/m"),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_USER)
                .long(ARG_RATE_LIMIT_USER)
                .help("Auth requests allowed per user, as count/unit with unit s, m, h or d")
                .env("PASEJO_RATE_LIMIT_USER")
                .default_value("600/m"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub allowed_origins: Vec<String>,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub rate_limit_ip: RateSpec,
    pub rate_limit_user: RateSpec,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let spec = |name: &str, default: RateSpec| {
            matches
                .get_one::<String>(name)
                .map_or(default, |value| RateSpec::parse(value))
        };

        Self {
            allowed_origins: matches
                .get_many::<String>(ARG_ALLOWED_ORIGINS)
                .map(|origins| origins.cloned().collect())
                .unwrap_or_default(),
            cookie_domain: matches.get_one::<String>(ARG_COOKIE_DOMAIN).cloned(),
            cookie_secure: matches
                .get_one::<bool>(ARG_COOKIE_SECURE)
                .copied()
                .unwrap_or(true),
            rate_limit_ip: spec(ARG_RATE_LIMIT_IP, DEFAULT_RATE_LIMIT_IP),
            rate_limit_user: spec(ARG_RATE_LIMIT_USER, DEFAULT_RATE_LIMIT_USER),
        }
    }
}
