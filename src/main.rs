// src/main.rs

//! The main entry point for the Shepherd control plane.

use anyhow::Result;
use shepherd::config::Config;
use shepherd::core::cluster::client::{ClusterClient, RespClusterClient};
use shepherd::core::supervisor::Supervisor;
use shepherd::server;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("Shepherd version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag; otherwise
    // it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    // The control plane cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Setup logging with compact format and ANSI colors; RUST_LOG overrides
    // the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!(
        "Shepherd {} starting with {} seed server(s)",
        VERSION,
        config.cluster.seed_servers.len()
    );

    let client: Arc<dyn ClusterClient> = Arc::new(RespClusterClient::from_config(&config.cluster)?);
    let config = Arc::new(config);
    let supervisor = Arc::new(Supervisor::spawn(config.clone(), client));

    // Relay ctrl-c into the shared shutdown signal.
    let shutdown_rx = supervisor.subscribe_shutdown();
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received; shutting down");
                supervisor.shutdown();
            }
        });
    }

    if config.http.enabled {
        server::run_http_server(&config.http, supervisor.clone(), shutdown_rx).await;
    } else {
        // Library-only mode: park until the shutdown signal fires.
        let mut shutdown_rx = shutdown_rx;
        shutdown_rx.recv().await.ok();
    }

    match Arc::try_unwrap(supervisor) {
        Ok(supervisor) => supervisor.shutdown_and_wait().await,
        Err(supervisor) => supervisor.shutdown(),
    }
    Ok(())
}
