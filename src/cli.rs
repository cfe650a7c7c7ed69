//! Command-line interface parsing for envdash
//!
//! This module handles parsing of CLI arguments using clap and turns them,
//! together with the environment-derived settings, into a `StartupConfig`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, Settings};
use crate::query::Query;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// A `-p` argument was not of the form key=value
    #[error("Invalid parameter: '{0}'. Expected key=value, e.g. site=01646500")]
    InvalidParam(String),

    /// A setting from the environment or a flag was invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// envdash - cached environmental data from public APIs
#[derive(Parser, Debug)]
#[command(name = "envdash")]
#[command(about = "Fetch and cache environmental measurements (USGS, AirNow)")]
#[command(version)]
pub struct Cli {
    /// Cache file location (overrides ENVDASH_CACHE_FILE)
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_file: Option<PathBuf>,

    /// Upstream request timeout in seconds (overrides ENVDASH_TIMEOUT_SECS)
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// TTL in seconds for entries written by this run
    #[arg(long, global = true, value_name = "SECS")]
    pub ttl: Option<u64>,

    /// Retries for transient failures (overrides ENVDASH_MAX_RETRIES)
    #[arg(long, global = true, value_name = "N")]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Resolve a query and print the records as JSON
    ///
    /// Examples:
    ///   envdash fetch usgs -p site=01646500 -p metric=discharge -p range=2024-01-01..2024-01-02
    ///   envdash fetch airnow -p zip=20002 -p date=2024-01-01
    Fetch {
        /// Source id (usgs, airnow)
        source: String,
        /// Query parameter as key=value, repeatable
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Inspect the cache file
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// List the registered data sources
    Sources,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Print the cache file location
    Path,
    /// List cached entries
    List,
}

/// What the binary should do once configured
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Fetch(Query),
    CachePath,
    CacheList,
    Sources,
}

/// Configuration derived from CLI arguments for application startup
#[derive(Debug, Clone, PartialEq)]
pub struct StartupConfig {
    /// Settings after flag overrides
    pub settings: Settings,
    /// Requested action
    pub action: Action,
}

/// Parses a `key=value` argument
///
/// # Returns
/// * `Ok((key, value))` with the key trimmed; the value may be empty
/// * `Err(CliError::InvalidParam)` if there is no `=` or the key is empty
pub fn parse_param_arg(s: &str) -> Result<(String, String), CliError> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| CliError::InvalidParam(s.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidParam(s.to_string()));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

impl StartupConfig {
    /// Creates a StartupConfig from parsed CLI arguments and base settings
    ///
    /// Flags take precedence over `settings`, which normally come from
    /// `Settings::from_env`.
    pub fn from_cli(cli: &Cli, mut settings: Settings) -> Result<Self, CliError> {
        if let Some(path) = &cli.cache_file {
            settings.cache_file = path.clone();
        }
        if let Some(secs) = cli.timeout {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "--timeout".to_string(),
                    value: "0".to_string(),
                }
                .into());
            }
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = cli.max_retries {
            settings.retry.max_retries = retries;
        }

        let action = match &cli.command {
            Command::Fetch { source, params } => {
                if let Some(ttl) = cli.ttl {
                    settings = settings.with_source_ttl(source.clone(), ttl);
                }
                let mut query = Query::new(source.trim());
                for param in params {
                    let (key, value) = parse_param_arg(param)?;
                    query = query.with_param(key, value);
                }
                Action::Fetch(query)
            }
            Command::Cache {
                action: CacheAction::Path,
            } => Action::CachePath,
            Command::Cache {
                action: CacheAction::List,
            } => Action::CacheList,
            Command::Sources => Action::Sources,
        };

        Ok(StartupConfig { settings, action })
    }
}
