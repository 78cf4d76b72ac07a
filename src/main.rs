use anyhow::Result;
use clap::{Parser, Subcommand};
use device_router::app::sample_devices;
use device_router::{Device, DeviceEventHandler, DeviceRouter, DeviceSelector, Settings};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "device-router", version, about = "Topic-routed device events over AMQP")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "DEVICE_ROUTER_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and publish device events
    Server,
    /// Consume events for one device type
    Consumer {
        #[arg(long, env = "DEVICE_TYPE")]
        device_type: Option<String>,
        #[arg(long, env = "STATE_PATTERN")]
        state_pattern: Option<String>,
    },
    /// Register devices and publish their state through the server
    Producer {
        #[arg(long, requires_all = ["device_type", "state"])]
        id: Option<String>,
        #[arg(long = "type")]
        device_type: Option<String>,
        #[arg(long)]
        state: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_router=info,lapin=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env()?,
    };
    tracing::info!("Configuration loaded: {:?}", settings);

    let router = DeviceRouter::new(settings);
    match cli.command {
        Command::Server => router.run_server().await?,
        Command::Consumer {
            device_type,
            state_pattern,
        } => {
            let selector = DeviceSelector::new(device_type, state_pattern);
            router
                .run_consumer(selector, Arc::new(DeviceEventHandler))
                .await?
        }
        Command::Producer {
            id,
            device_type,
            state,
        } => {
            let devices = match (id, device_type, state) {
                (Some(id), Some(device_type), Some(state)) => {
                    vec![Device::new(id, device_type, state)]
                }
                _ => sample_devices(),
            };
            router.run_producer(devices).await?
        }
    }

    Ok(())
}
