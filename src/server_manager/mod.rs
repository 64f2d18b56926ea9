//! The Server Manager: routes uplinks to the Network Server through the
//! Protocol Engine and Connector, drives the heartbeat, and hands
//! downlinks back to the Node Manager (§4.4).
//!
//! `udp/mod.rs` plays the Network-Server/LNS side of this exchange
//! (receives PUSH_DATA/PULL_DATA, sends ACKs); this module is its mirror
//! image, since per §1 this crate is the *gateway*: it builds and sends
//! PUSH_DATA/PULL_DATA/TX_ACK and receives PUSH_ACK/PULL_ACK/PULL_RESP
//! back.

pub mod messages;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::connector::{ConnectorEvent, ServerConnector};
use crate::error::SessionError;
use crate::lorawan::parse_frame_header;
use crate::node_manager::{DownlinkOutcome, NodeManagerEvent, NodeManagerHandle, UplinkForward};
use crate::protocol::{HeartbeatPeriods, ProtocolEngine, ServerEvent, SessionEvent, UplinkRequest};
use crate::transceiver::TxPacket;

pub use messages::ServerUpMessage;

enum Command {
    ForceHeartbeat,
}

/// Handle used by the CLI/admin surface to drive the Server Manager.
#[derive(Clone)]
pub struct ServerManagerHandle {
    command_tx: mpsc::Sender<Command>,
}

impl ServerManagerHandle {
    /// §4.4/§9: bypass the PUSHSTAT/PULLDATA period checks and emit a
    /// `stat` uplink unconditionally, e.g. right after a connector
    /// reconnects so the first scheduled tick is not a silent no-op
    /// while counters are still zero.
    pub fn force_heartbeat(&self) {
        let _ = self.command_tx.try_send(Command::ForceHeartbeat);
    }
}

/// Spawns the Server Manager's three cooperating tasks (main, node-event,
/// connector-event).
pub fn spawn(
    gateway_eui: [u8; 8],
    transaction_id_bits: u8,
    periods: HeartbeatPeriods,
    node_manager: NodeManagerHandle,
    mut uplink_forwards: mpsc::Receiver<UplinkForward>,
    mut downlink_outcomes: mpsc::Receiver<DownlinkOutcome>,
    connector: Arc<dyn ServerConnector>,
    mut connector_events: mpsc::Receiver<ConnectorEvent>,
) -> ServerManagerHandle {
    let engine = Arc::new(ProtocolEngine::new(gateway_eui, transaction_id_bits, periods));
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(8);
    let next_server_msg_id = Arc::new(std::sync::atomic::AtomicU32::new(1));
    let pending_uplinks: Arc<Mutex<HashMap<u32, ServerUpMessage>>> =
        Arc::new(Mutex::new(HashMap::new()));

    // Main task: heartbeat tick + forced-heartbeat commands.
    {
        let engine = engine.clone();
        let connector = connector.clone();
        let next_id = next_server_msg_id.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Command::ForceHeartbeat) => {
                                send_heartbeat(&engine, &connector, &next_id, true).await;
                            }
                            None => return,
                        }
                    }
                    _ = tick.tick() => {
                        send_heartbeat(&engine, &connector, &next_id, false).await;
                    }
                }
            }
        });
    }

    // Node task: pumps uplinks forwarded by the Node Manager through the
    // Protocol Engine and the active Connector.
    {
        let engine = engine.clone();
        let connector = connector.clone();
        let node_manager = node_manager.clone();
        let next_id = next_server_msg_id.clone();
        let pending_uplinks = pending_uplinks.clone();
        tokio::spawn(async move {
            while let Some(forward) = uplink_forwards.recv().await {
                let rxpk = vec![crate::protocol::json::Rxpk::new(
                    forward.rx_timestamp_ms,
                    chrono::Utc::now().to_rfc3339(),
                    0,
                    0,
                    forward.freq_mhz,
                    forward.datr.clone(),
                    forward.codr.clone(),
                    forward.rssi,
                    forward.snr,
                    &forward.payload,
                )];
                let server_msg_id = next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let confirmed = matches!(
                    forward.message_type,
                    crate::lorawan::MessageType::ConfirmedUplink
                );

                match engine.build_uplink(
                    UplinkRequest::LoraData { rxpk },
                    server_msg_id,
                    crate::transceiver::now_ms(),
                ) {
                    Ok(Some((message, protocol_msg_id))) => {
                        node_manager.session_event(NodeManagerEvent::UplinkAccepted {
                            session_id: forward.session_id,
                        });
                        match connector.send(&message.encode()).await {
                            Ok(()) => {
                                engine.process_session_event(protocol_msg_id, SessionEvent::Sent);
                                pending_uplinks.lock().await.insert(
                                    protocol_msg_id,
                                    ServerUpMessage {
                                        uplink_session_id: forward.session_id,
                                        protocol_msg_id,
                                        confirmed,
                                    },
                                );
                                node_manager.session_event(NodeManagerEvent::UplinkProgressing {
                                    session_id: forward.session_id,
                                });
                            }
                            Err(e) => {
                                let transport_err = SessionError::TransportFailure(e.to_string());
                                warn!(error = %transport_err, "connector send failed");
                                engine.process_session_event(
                                    protocol_msg_id,
                                    SessionEvent::SendFailed,
                                );
                                node_manager.session_event(NodeManagerEvent::UplinkFailed {
                                    session_id: forward.session_id,
                                });
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to build uplink");
                        node_manager.session_event(NodeManagerEvent::UplinkFailed {
                            session_id: forward.session_id,
                        });
                    }
                }
            }
        });
    }

    // Connector task: datagrams arriving from the Network Server.
    {
        let engine = engine.clone();
        let node_manager = node_manager.clone();
        let pending_uplinks = pending_uplinks.clone();
        tokio::spawn(async move {
            while let Some(event) = connector_events.recv().await {
                match event {
                    ConnectorEvent::DatagramReceived(datagram) => {
                        match engine.process_server_message(&datagram) {
                            Ok(ServerEvent::UplinkTerminated { protocol_msg_id }) => {
                                let pending = pending_uplinks.lock().await.remove(&protocol_msg_id);
                                match pending {
                                    Some(up) => {
                                        engine.process_session_event(
                                            protocol_msg_id,
                                            SessionEvent::Released,
                                        );
                                        node_manager.session_event(NodeManagerEvent::UplinkSent {
                                            session_id: up.uplink_session_id,
                                            confirmed: up.confirmed,
                                        });
                                    }
                                    None => warn!(protocol_msg_id, "ack for unknown uplink"),
                                }
                            }
                            Ok(ServerEvent::Downlink { protocol_msg_id, packet }) => {
                                let dev_addr = parse_frame_header(&packet.payload)
                                    .map(|h| h.dev_addr)
                                    .unwrap_or(0);
                                let tx_packet = TxPacket {
                                    freq_mhz: packet.freq_mhz,
                                    datr: packet.datr,
                                    codr: packet.codr,
                                    immediate: packet.immediate,
                                    payload: packet.payload,
                                    downlink_session_id: 0,
                                };
                                node_manager.receive_server_downlink(
                                    dev_addr,
                                    tx_packet,
                                    protocol_msg_id,
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed server message");
                            }
                        }
                    }
                    ConnectorEvent::ConnectivityLost => warn!("connector lost connectivity"),
                    ConnectorEvent::ConnectivityRestored => info!("connector restored"),
                }
            }
        });
    }

    // TX_ACK task: reports a Node Manager downlink outcome back to the
    // Network Server as the matching PULL_RESP's TX_ACK (§4.3).
    {
        let engine = engine.clone();
        let connector = connector.clone();
        tokio::spawn(async move {
            while let Some(outcome) = downlink_outcomes.recv().await {
                let token = (outcome.protocol_msg_id & 0xFFFF) as u16;
                let succeeded = outcome.result.is_ok();
                let ack = engine.build_tx_ack(token, outcome.result.err());
                if let Err(e) = connector.send(&ack.encode()).await {
                    let transport_err = SessionError::TransportFailure(e.to_string());
                    warn!(error = %transport_err, "tx_ack send failed");
                } else if succeeded {
                    engine.record_downlink_sent();
                }
            }
        });
    }

    ServerManagerHandle { command_tx }
}


async fn send_heartbeat(
    engine: &Arc<ProtocolEngine>,
    connector: &Arc<dyn ServerConnector>,
    next_id: &Arc<std::sync::atomic::AtomicU32>,
    force: bool,
) {
    let server_msg_id = next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    match engine.build_uplink(
        UplinkRequest::Heartbeat { force },
        server_msg_id,
        crate::transceiver::now_ms(),
    ) {
        Ok(Some((message, protocol_msg_id))) => {
            if let Err(e) = connector.send(&message.encode()).await {
                warn!(error = %e, "heartbeat send failed");
                engine.process_session_event(protocol_msg_id, SessionEvent::SendFailed);
            } else {
                engine.process_session_event(protocol_msg_id, SessionEvent::Sent);
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to build heartbeat"),
    }
}
