use std::path::PathBuf;

use clap::Parser;
use snoozegate::app::Application;
use snoozegate::config::Config;
use snoozegate::pool::RuntimePool;
use tracing::{error, info, warn};

/// Transparent L4 reverse proxy that pauses idle containers and wakes
/// them on demand.
#[derive(Debug, Parser)]
#[command(name = "snoozegate", version, about)]
struct Cli {
    /// Path to the JSON configuration file (default: config.json).
    /// Multiple values are joined with spaces.
    #[arg(value_name = "CONFIG")]
    config: Vec<String>,

    /// Raise log verbosity to trace
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "snoozegate=trace"
    } else {
        "snoozegate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let config_path = if cli.config.is_empty() {
        PathBuf::from("config.json")
    } else {
        PathBuf::from(cli.config.join(" "))
    };

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(
        path = %config_path.display(),
        applications = config.applications.len(),
        "configuration loaded"
    );

    let pool = RuntimePool::new();
    let mut engines = Vec::new();

    for app_config in config.applications {
        let name = app_config.container_name.clone();

        let client = match pool.get_client(&app_config.socket_uri) {
            Ok(client) => client,
            Err(e) => {
                error!(
                    container = %name,
                    error = %e,
                    "runtime connection failed, skipping application"
                );
                continue;
            }
        };

        match Application::start(app_config, client).await {
            Ok(engine) => engines.push(engine),
            Err(e) => {
                error!(container = %name, error = %e, "failed to start application engine");
            }
        }
    }

    if engines.is_empty() {
        warn!("no application engines running");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }

    for engine in engines {
        engine.shutdown().await;
    }
    pool.shutdown();

    info!("shutdown complete");
    Ok(())
}
