//! LoRaWAN gateway bridging LoRa end-devices to a Semtech-protocol
//! Network Server: Node Manager, Realtime Sender, Protocol Engine and
//! Server Manager wired together per the component design in
//! `DESIGN.md`.

pub mod config;
pub mod connector;
pub mod error;
pub mod lorawan;
pub mod node_manager;
pub mod pool;
pub mod protocol;
pub mod realtime_sender;
pub mod server_manager;
pub mod transceiver;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use config::Config;
use connector::{ConnectorEvent, ServerConnector, UdpConnector};
use protocol::HeartbeatPeriods;
use transceiver::{LoraTransceiver, RadioEvent, TransceiverHandle};

/// Wires the Node Manager and Server Manager together against a live UDP
/// connector, returning handles to both.
pub async fn run_gateway(
    config: Config,
    transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>>,
    radio_events: mpsc::Receiver<RadioEvent>,
) -> anyhow::Result<(node_manager::NodeManagerHandle, server_manager::ServerManagerHandle)> {
    let (connector_event_tx, connector_event_rx) = mpsc::channel::<ConnectorEvent>(64);
    let connector: Arc<dyn ServerConnector> =
        UdpConnector::connect(&config.network_server.socket_addr(), connector_event_tx).await?;

    let gateway_eui = config.gateway.gateway_eui();
    let transaction_id_bits = config.capacity.transaction_id_bits;
    let periods = HeartbeatPeriods {
        pushstat_period_ms: config.heartbeat.pushstat_period_ms,
        pulldata_period_ms: config.heartbeat.pulldata_period_ms,
    };

    let (node_manager_handle, uplink_forwards, downlink_outcomes) =
        node_manager::spawn(config, transceivers, radio_events);

    let server_manager_handle = server_manager::spawn(
        gateway_eui,
        transaction_id_bits,
        periods,
        node_manager_handle.clone(),
        uplink_forwards,
        downlink_outcomes,
        connector,
        connector_event_rx,
    );

    Ok((node_manager_handle, server_manager_handle))
}
