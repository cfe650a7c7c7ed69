//! envdash - fetch environmental measurements through the local cache
//!
//! Resolves a query against the configured sources and prints the records as
//! JSON on stdout. Logs go to stderr; set `RUST_LOG` to change verbosity.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use envdash::cli::{Action, Cli, CliError, StartupConfig};
use envdash::source::{AirNowAdapter, SourceRegistry, UsgsAdapter};
use envdash::{CacheStore, FetchCoordinator, Settings};

/// Installs the stderr log subscriber, defaulting to info for this crate
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("envdash=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Registers every adapter the settings allow
fn build_registry(settings: &Settings) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(UsgsAdapter::new(settings.request_timeout)));

    match &settings.airnow_api_key {
        Some(key) => {
            registry.register(Arc::new(AirNowAdapter::new(key.clone(), settings.request_timeout)));
        }
        None => tracing::debug!("AIRNOW_API_KEY not set, AirNow source disabled"),
    }
    registry
}

fn build_store(settings: &Settings) -> CacheStore {
    let store = CacheStore::new(settings.cache_file.clone());
    match settings.max_cache_entries {
        Some(max) => store.with_max_entries(max),
        None => store,
    }
}

async fn run(config: StartupConfig) -> Result<(), Box<dyn std::error::Error>> {
    let StartupConfig { settings, action } = config;

    match action {
        Action::CachePath => {
            println!("{}", settings.cache_file.display());
        }
        Action::CacheList => {
            let store = build_store(&settings);
            println!("{}", serde_json::to_string_pretty(&store.entries())?);
        }
        Action::Sources => {
            let registry = build_registry(&settings);
            for id in registry.source_ids() {
                println!("{}\tttl={}s", id, settings.ttl_for(id));
            }
        }
        Action::Fetch(query) => {
            let registry = build_registry(&settings);
            let store = build_store(&settings);
            let coordinator = FetchCoordinator::new(registry, store, settings);

            let resolved = coordinator.resolve(&query).await?;
            if let Some(warning) = &resolved.warning {
                eprintln!(
                    "warning: serving stale data ({}s old): {}",
                    warning.age_seconds, warning.reason
                );
            }
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let config = match Settings::from_env()
        .map_err(CliError::from)
        .and_then(|settings| StartupConfig::from_cli(&cli, settings))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
