use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_DB_CONNECT_TIMEOUT_MS: &str = "db-connect-timeout-ms";
pub const ARG_DB_STATEMENT_TIMEOUT_MS: &str = "db-statement-timeout-ms";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DB_CONNECT_TIMEOUT_MS)
                .long(ARG_DB_CONNECT_TIMEOUT_MS)
                .help("Maximum wait for a pooled database connection, in milliseconds")
                .env("PASEJO_DB_CONNECT_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_DB_STATEMENT_TIMEOUT_MS)
                .long(ARG_DB_STATEMENT_TIMEOUT_MS)
                .help("Server-side statement timeout, in milliseconds")
                .env("PASEJO_DB_STATEMENT_TIMEOUT_MS")
                .default_value("10000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl Options {
    /// # Errors
    /// Returns an error if a timeout is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let millis = |name: &str| -> Result<Duration> {
            matches
                .get_one::<u64>(name)
                .copied()
                .map(Duration::from_millis)
                .with_context(|| format!("missing required argument: --{name}"))
        };
        Ok(Self {
            connect_timeout: millis(ARG_DB_CONNECT_TIMEOUT_MS)?,
            statement_timeout: millis(ARG_DB_STATEMENT_TIMEOUT_MS)?,
        })
    }
}
