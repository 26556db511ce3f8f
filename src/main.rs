//! CLI entry point for asicam.
//!
//! Serve the HTTP API:
//! ```bash
//! asicam serve --config config/asicam.toml
//! asicam serve --mock --port 9000
//! ```
//!
//! Check that the SDK loads and a camera answers:
//! ```bash
//! asicam detect
//! ```

use anyhow::{anyhow, Context, Result};
use asicam::camera::CameraService;
use asicam::config::{Backend, ServiceConfig, DEFAULT_CONFIG_PATH};
use asicam::hardware::asi::AsiCamera;
use asicam::hardware::mock::MockCamera;
use asicam::hardware::HardwareHandle;
use asicam::{http, logging};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "asicam")]
#[command(about = "ZWO ASI camera control service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the listening port
        #[arg(long)]
        port: Option<u16>,

        /// Use the simulated camera
        #[arg(long)]
        mock: bool,
    },

    /// Open the configured camera, print its description and close it
    Detect {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<ServiceConfig> {
    let config = ServiceConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, mock } => {
            let mut config = load_config(&config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if mock {
                config.camera.backend = Backend::Mock;
            }
            logging::init(&config.logging).map_err(|e| anyhow!(e))?;
            serve(config).await
        }
        Commands::Detect { config } => {
            let config = load_config(&config)?;
            logging::init(&config.logging).map_err(|e| anyhow!(e))?;
            detect(&config).await
        }
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;

    let service = Arc::new(CameraService::from_config(&config));
    if config.camera.connect_on_startup {
        match service.connect().await {
            Ok(info) => tracing::info!(camera = %info.name, "Connected at startup"),
            Err(e) => tracing::warn!(error = %e, "Startup connect failed; use POST /camera/connect"),
        }
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
    };

    http::serve(Arc::clone(&service), addr, shutdown).await?;
    service.shutdown().await;
    Ok(())
}

async fn detect(config: &ServiceConfig) -> Result<()> {
    let mut camera: Box<dyn HardwareHandle> = match config.camera.backend {
        Backend::Asi => Box::new(AsiCamera::new(config.camera.library_candidates())),
        Backend::Mock => Box::new(MockCamera::new(
            config.camera.mock_width,
            config.camera.mock_height,
        )),
    };
    let info = tokio::task::spawn_blocking(move || {
        let info = camera.open();
        camera.close();
        info
    })
    .await??;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
