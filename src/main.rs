use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lorawan_gateway::config::Config;
use lorawan_gateway::transceiver::{LoraTransceiver, SimTransceiver, TransceiverHandle};

#[derive(Parser)]
#[command(name = "lorawan-gateway")]
#[command(about = "LoRaWAN gateway bridging LoRa end-devices to a Semtech-protocol Network Server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Emit an immediate `stat` heartbeat on startup instead of waiting
    /// for the first scheduled tick.
    #[arg(long)]
    force_heartbeat_on_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lorawan-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(gateway_eui = %hex::encode(config.gateway.gateway_eui()), "starting");

    let (radio_event_tx, radio_event_rx) = mpsc::channel(256);
    let mut transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>> = HashMap::new();
    for (index, transceiver_config) in config.transceivers.iter().enumerate() {
        let handle = TransceiverHandle(index);
        let sim = Arc::new(SimTransceiver::new(handle, radio_event_tx.clone()));
        sim.initialize(transceiver_config).await?;
        sim.receive().await?;
        transceivers.insert(handle, sim);
    }
    drop(radio_event_tx);

    let (_node_manager, server_manager) =
        lorawan_gateway::run_gateway(config, transceivers, radio_event_rx).await?;

    if cli.force_heartbeat_on_start {
        server_manager.force_heartbeat();
    }

    info!("gateway running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
