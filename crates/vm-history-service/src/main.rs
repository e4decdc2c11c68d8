//! # VM History Service
//!
//! Binary entry point for the VM history HTTP service.
//!
//! This executable:
//! - Parses command line arguments
//! - Loads and validates configuration from files and environment
//! - Initializes logging
//! - Opens the event store and starts the HTTP server from vm-history-api
//!
//! Exit codes: 1 bind failure, 2 server failure, 3 configuration error,
//! 4 storage initialization failure.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vm_history_api::{
    open_event_store, start_server, LoggingConfig, RequestObserver, ServiceConfig,
};
use vm_history_core::{CredentialCipher, SensitiveDataMasker};

/// Records VM operation history and serves it over HTTP
#[derive(Debug, Parser)]
#[command(name = "vm-history-service", version, about)]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(short, long, env = "VMH_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the configuration, so load first and
    // report any load failure once the subscriber exists.
    let loaded = ServiceConfig::load(cli.config.as_deref());
    let logging = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging);

    info!("Starting VM History Service");

    let service_config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(
                error = %e,
                "Could not load service configuration; aborting. \
                 Fix the configuration and restart."
            );
            std::process::exit(3);
        }
    };

    if let Err(e) = service_config.validate() {
        error!(error = %e, "Service configuration is invalid; aborting");
        std::process::exit(3);
    }

    let cipher = match CredentialCipher::from_config(&service_config.encryption) {
        Ok(cipher) => cipher,
        Err(e) => {
            error!(error = %e, "Failed to derive credential keys; aborting");
            std::process::exit(3);
        }
    };
    info!(key_fingerprint = %cipher.key_fingerprint(), "Credential cipher ready");

    if cli.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let event_store = match open_event_store(&service_config.storage).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open event store; aborting");
            std::process::exit(e.exit_code());
        }
    };

    let masker = Arc::new(SensitiveDataMasker::new(&service_config.masking));
    let observer = RequestObserver::new(
        event_store.clone(),
        masker,
        service_config.observer.clone(),
    );

    info!(
        host = %service_config.server.host,
        port = service_config.server.port,
        "Starting HTTP server"
    );

    if let Err(e) = start_server(service_config, event_store, observer).await {
        error!("Failed to start server: {}", e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vm_history_service={0},vm_history_api={0},vm_history_core={0},tower_http=info",
            logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
