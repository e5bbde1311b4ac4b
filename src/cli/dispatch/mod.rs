//! Map validated CLI arguments to an action.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{db, edge, session, upstream, ARG_API_BASE_PATH, ARG_DSN, ARG_PORT};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let api_base_path = matches
        .get_one::<String>(ARG_API_BASE_PATH)
        .cloned()
        .context("missing required argument: --api-base-path")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        api_base_path,
        db: db::Options::parse(matches)?,
        session: session::Options::parse(matches)?,
        upstream: upstream::Options::parse(matches)?,
        edge: edge::Options::parse(matches),
    }))
}
