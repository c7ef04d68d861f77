//! Droid inference - HTTP service entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use droid_inference::model::is_model_dir;
use droid_inference::utils::{setup_logging, LogConfig};
use droid_inference::{EngineBuilder, EngineConfig, Features, ModelFamily};

/// Sentiment-routed classification and generation over local models.
#[derive(Parser, Debug)]
#[command(name = "droid-inference", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API until Ctrl-C (default).
    Serve {
        /// TOML config file. Defaults to ./droid.toml when present.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override server.host.
        #[arg(long)]
        host: Option<String>,
        /// Override server.port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the model family a locator resolves to.
    Family {
        locator: String,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        config: None,
        host: None,
        port: None,
    }) {
        Commands::Serve { config, host, port } => serve(config, host, port).await,
        Commands::Family { locator } => {
            println!("{}", ModelFamily::from_locator(&locator));
            if !is_model_dir(&locator) {
                eprintln!("note: '{locator}' is not a readable model directory");
            }
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let config = EngineConfig::load(config.as_deref()).context("invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            print!("{}", Features::detect());
            Ok(())
        }
    }
}

async fn serve(config: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(config.as_deref()).context("invalid configuration")?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    setup_logging(LogConfig::from(&config.monitoring)).context("failed to initialise logging")?;
    info!(version = droid_inference::VERSION, "Starting droid-inference");
    for line in Features::detect().to_string().lines() {
        info!("{line}");
    }

    let server = config.server.clone();
    let engine = EngineBuilder::new()
        .with_config(config)
        .build()
        .context("failed to build inference engine")?;

    droid_inference::server::serve(&server, Arc::new(engine))
        .await
        .context("server failed")?;
    Ok(())
}
