//! Command-line argument parsing.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Flags that override the configuration file.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Explicit configuration file.
    pub config_path: Option<PathBuf>,
    /// Override for the participant listen address.
    pub bind: Option<String>,
    /// Override for the parent MD address.
    pub upstream: Option<String>,
    /// Override for the log level.
    pub log_level: Option<String>,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse the process arguments, exiting with usage on error.
    #[must_use]
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parse an explicit argument list.
    ///
    /// # Errors
    ///
    /// Returns the clap error for unknown or malformed arguments.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches.get_one::<String>("config").map(PathBuf::from),
            bind: matches.get_one::<String>("bind").cloned(),
            upstream: matches.get_one::<String>("upstream").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("astrond")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Astron message director")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Participant listen address (e.g., 127.0.0.1:7199)"),
        )
        .arg(
            Arg::new("upstream")
                .short('u')
                .long("upstream")
                .value_name("ADDRESS")
                .help("Parent message director to connect to"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}
