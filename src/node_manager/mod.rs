//! The Node Manager: owns the uplink/downlink session lifecycle and
//! enforces LoRaWAN Class-A timing (§4.1).
//!
//! Grounded in `original_source/main/LoraNodeManager.c`'s three-task
//! structure (session-manager, transceiver, server) and
//! `TransceiverManagerItf.h`'s `SESSIONEVENT_*` constants for the event
//! vocabulary, with the command/reply channel pattern (§4.1) replacing
//! the original's mutex + command descriptor + completion semaphore.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::config::Config;
use crate::error::ScheduleError;
use crate::lorawan::{build_ack_frame, parse_frame_header, MessageType};
use crate::pool::{Pool, PoolId};
use crate::realtime_sender::{DeviceClass, RealtimeEvent, RealtimeSender};
use crate::transceiver::{LoraTransceiver, RadioEvent, TransceiverHandle, TxPacket};

pub use session::{DownlinkSession, DownlinkSessionState, UplinkSession, UplinkSessionState};

pub const RECEIVE_DELAY2_MS: u64 = 2000;
pub const JOIN_ACCEPT_DELAY2_MS: u64 = 6000;
pub const RX_WINDOW_LENGTH_MS: u64 = 900;
const SWEEP_INTERVAL_MS: u64 = 500;
const FORWARD_EXCHANGE_RETRY_MS: u64 = 50;

/// Inbound notification from the Server Manager or the Realtime Sender
/// (§4.1 `session_event` kinds).
#[derive(Debug, Clone)]
pub enum NodeManagerEvent {
    UplinkAccepted { session_id: PoolId },
    UplinkRejected { session_id: PoolId },
    UplinkProgressing { session_id: PoolId },
    UplinkSent { session_id: PoolId, confirmed: bool },
    UplinkFailed { session_id: PoolId },
}

/// A frame handed to the Server Manager for forwarding (§4.1 step 5, "the
/// single-slot forward exchange buffer").
#[derive(Debug, Clone)]
pub struct UplinkForward {
    pub session_id: PoolId,
    pub dev_addr: u32,
    pub fcnt: u16,
    pub message_type: MessageType,
    pub rx_timestamp_ms: u64,
    pub freq_mhz: f64,
    pub datr: String,
    pub codr: String,
    pub snr: f64,
    pub rssi: f64,
    pub payload: Vec<u8>,
}

struct PendingExchange {
    forward: UplinkForward,
}

/// Outcome of a downlink that originated from a Network-Server PULL_RESP,
/// reported back to the Server Manager so it can build the matching
/// TX_ACK (§4.3 "TX_ACK carries a JSON `{"txpk_ack":{"error":"…"}}`
/// body"). Downlinks the Node Manager synthesizes itself (the confirmed-
/// uplink ACK) have no `protocol_msg_id` and never produce one of these.
#[derive(Debug, Clone)]
pub struct DownlinkOutcome {
    pub protocol_msg_id: u32,
    pub result: Result<(), ScheduleError>,
}

/// Where a `DownlinkSession` came from — tracked so the Node Manager
/// knows whether a terminal event needs reporting back to the Server
/// Manager (PULL_RESP origin) or not (self-synthesized ACK).
#[derive(Debug, Clone, Copy)]
enum DownlinkOrigin {
    SelfAck,
    Server { protocol_msg_id: u32 },
}

/// Shared state behind a cloneable `NodeManagerHandle`.
struct Inner {
    config: Config,
    uplink_sessions: Pool<UplinkSession>,
    downlink_sessions: Pool<DownlinkSession>,
    exchange: Mutex<Option<PendingExchange>>,
    missed_uplinks: std::sync::atomic::AtomicU64,
    realtime_sender: RealtimeSender,
    downlink_origins: Mutex<HashMap<u64, DownlinkOrigin>>,
    downlink_outcomes: mpsc::Sender<DownlinkOutcome>,
}

/// Handle used by the Server Manager and the bin harness to drive and
/// observe the Node Manager.
#[derive(Clone)]
pub struct NodeManagerHandle {
    inner: Arc<Inner>,
    forward_tx: mpsc::Sender<UplinkForward>,
    command_tx: mpsc::Sender<Command>,
}

enum Command {
    SessionEvent(NodeManagerEvent),
}

impl NodeManagerHandle {
    pub fn session_event(&self, event: NodeManagerEvent) {
        let _ = self.command_tx.try_send(Command::SessionEvent(event));
    }

    pub fn missed_uplinks(&self) -> u64 {
        self.inner
            .missed_uplinks
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// §4.3/§4.1: a PULL_RESP arrived at the Server Manager and decoded
    /// into a downlink payload. Runs the same downlink-receive path as a
    /// self-synthesized ACK, but reports its terminal outcome back over
    /// the `downlink_outcomes` channel tagged with `protocol_msg_id` so
    /// the Server Manager can build the TX_ACK.
    pub fn receive_server_downlink(
        &self,
        dev_addr_hint: u32,
        packet: TxPacket,
        protocol_msg_id: u32,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(transceiver) = inner.realtime_sender.transceiver_for(dev_addr_hint).await
            else {
                let _ = inner
                    .downlink_outcomes
                    .send(DownlinkOutcome {
                        protocol_msg_id,
                        result: Err(ScheduleError::TooLate),
                    })
                    .await;
                return;
            };
            spawn_downlink_receive(
                inner,
                transceiver,
                dev_addr_hint,
                packet,
                DownlinkOrigin::Server { protocol_msg_id },
            )
            .await;
        });
    }
}

/// Spawns the Node Manager's three cooperating tasks and returns a handle,
/// the channel the Server Manager should read forwarded uplinks from, and
/// the channel it should read server-initiated downlink outcomes from.
pub fn spawn(
    config: Config,
    transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>>,
    mut radio_events: mpsc::Receiver<RadioEvent>,
) -> (
    NodeManagerHandle,
    mpsc::Receiver<UplinkForward>,
    mpsc::Receiver<DownlinkOutcome>,
) {
    let (realtime_sender, mut realtime_events) = RealtimeSender::new(config.capacity.max_nodes);
    let (downlink_outcomes_tx, downlink_outcomes_rx) = mpsc::channel::<DownlinkOutcome>(64);
    let inner = Arc::new(Inner {
        uplink_sessions: Pool::with_capacity(config.capacity.max_up_sessions()),
        downlink_sessions: Pool::with_capacity(config.capacity.max_down_sessions()),
        exchange: Mutex::new(None),
        missed_uplinks: std::sync::atomic::AtomicU64::new(0),
        realtime_sender: realtime_sender.clone(),
        downlink_origins: Mutex::new(HashMap::new()),
        downlink_outcomes: downlink_outcomes_tx,
        config: config.clone(),
    });

    let (forward_tx, forward_rx) = mpsc::channel(1);
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(64);

    tokio::spawn(realtime_sender.run(transceivers, crate::transceiver::now_ms));

    let handle = NodeManagerHandle {
        inner: inner.clone(),
        forward_tx: forward_tx.clone(),
        command_tx,
    };

    // Session-manager task: consumes commands, sweeps on idle timeout.
    {
        let inner = inner.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
            loop {
                tokio::select! {
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Command::SessionEvent(event)) => handle_session_event(&inner, event).await,
                            None => return,
                        }
                    }
                    _ = tick.tick() => {
                        sweep_sessions(&inner, crate::transceiver::now_ms());
                    }
                }
            }
        });
    }

    // Transceiver task: consumes packet-received/packet-sent events.
    {
        let inner = inner.clone();
        let forward_tx = forward_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = radio_events.recv().await {
                match event {
                    RadioEvent::PacketReceived {
                        transceiver,
                        payload,
                        rx_timestamp_ms,
                        metadata,
                    } => {
                        handle_packet_received(
                            &inner,
                            &forward_tx,
                            transceiver,
                            payload,
                            rx_timestamp_ms,
                            metadata,
                        )
                        .await;
                    }
                    RadioEvent::PacketSent {
                        downlink_session_id,
                        ..
                    } => {
                        handle_packet_sent(&inner, downlink_session_id).await;
                    }
                }
            }
        });
    }

    // Server task: consumes Realtime Sender downlink outcomes.
    {
        let inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = realtime_events.recv().await {
                match event {
                    RealtimeEvent::DownlinkScheduled { .. } => {}
                    RealtimeEvent::DownlinkSending { downlink_session_id } => {
                        let id = PoolId::from_u64(downlink_session_id);
                        inner
                            .downlink_sessions
                            .with_mut(id, |s| s.state = DownlinkSessionState::Sending);
                    }
                    RealtimeEvent::DownlinkFailed {
                        downlink_session_id,
                        error,
                    } => {
                        warn!(?error, downlink_session_id, "downlink send failed");
                        let id = PoolId::from_u64(downlink_session_id);
                        inner
                            .downlink_sessions
                            .with_mut(id, |s| s.state = DownlinkSessionState::Failed);
                        inner.downlink_sessions.release(id);
                        let origin = inner.downlink_origins.lock().await.remove(&downlink_session_id);
                        if let Some(DownlinkOrigin::Server { protocol_msg_id }) = origin {
                            let _ = inner
                                .downlink_outcomes
                                .send(DownlinkOutcome {
                                    protocol_msg_id,
                                    result: Err(error),
                                })
                                .await;
                        }
                    }
                }
            }
        });
    }

    (handle, forward_rx, downlink_outcomes_rx)
}

/// The radio finished transmitting a downlink on the air (§4.1 "the
/// transceiver's own packet-sent event later drives downlink-sent"):
/// transition the session to *sent*, release its slot, and if it
/// originated from a PULL_RESP, report the success back to the Server
/// Manager for its TX_ACK.
async fn handle_packet_sent(inner: &Arc<Inner>, downlink_session_id: u64) {
    let id = PoolId::from_u64(downlink_session_id);
    inner
        .downlink_sessions
        .with_mut(id, |s| s.state = DownlinkSessionState::Sent);
    inner.downlink_sessions.release(id);
    let origin = inner.downlink_origins.lock().await.remove(&downlink_session_id);
    if let Some(DownlinkOrigin::Server { protocol_msg_id }) = origin {
        let _ = inner
            .downlink_outcomes
            .send(DownlinkOutcome {
                protocol_msg_id,
                result: Ok(()),
            })
            .await;
    }
}

async fn handle_packet_received(
    inner: &Arc<Inner>,
    forward_tx: &mpsc::Sender<UplinkForward>,
    transceiver: TransceiverHandle,
    payload: Vec<u8>,
    rx_timestamp_ms: u64,
    metadata: crate::transceiver::RxMetadata,
) {
    let header = match parse_frame_header(&payload) {
        Ok(h) => h,
        Err(_) => {
            inner
                .missed_uplinks
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
    };

    let session = UplinkSession {
        transceiver,
        dev_addr: header.dev_addr,
        fcnt: header.fcnt,
        message_type: header.message_type,
        rx_timestamp_ms,
        state: UplinkSessionState::Receiving,
    };

    let Ok(session_id) = inner.uplink_sessions.allocate_writing(session) else {
        inner
            .missed_uplinks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return;
    };
    inner.uplink_sessions.mark_ready(session_id);

    let forward = UplinkForward {
        session_id,
        dev_addr: header.dev_addr,
        fcnt: header.fcnt,
        message_type: header.message_type,
        rx_timestamp_ms,
        freq_mhz: metadata.freq_mhz,
        datr: metadata.datr,
        codr: metadata.codr,
        snr: metadata.snr,
        rssi: metadata.rssi,
        payload,
    };

    {
        let mut exchange = inner.exchange.lock().await;
        if exchange.is_some() {
            drop(exchange);
            tokio::time::sleep(Duration::from_millis(FORWARD_EXCHANGE_RETRY_MS)).await;
            exchange = inner.exchange.lock().await;
            if exchange.is_some() {
                inner
                    .missed_uplinks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                inner.uplink_sessions.release(session_id);
                return;
            }
        }
        *exchange = Some(PendingExchange {
            forward: forward.clone(),
        });
    }

    inner
        .uplink_sessions
        .with_mut(session_id, |s| s.state = UplinkSessionState::SendingUplink);

    if forward_tx.send(forward).await.is_err() {
        return;
    }

    let class = DeviceClass::A;
    let _ = inner
        .realtime_sender
        .register_node_rx_windows(class, header.dev_addr, transceiver, rx_timestamp_ms)
        .await;
}

async fn handle_session_event(inner: &Arc<Inner>, event: NodeManagerEvent) {
    match event {
        NodeManagerEvent::UplinkAccepted { .. } => {
            *inner.exchange.lock().await = None;
        }
        NodeManagerEvent::UplinkRejected { session_id } => {
            *inner.exchange.lock().await = None;
            inner.uplink_sessions.release(session_id);
        }
        NodeManagerEvent::UplinkProgressing { session_id } => {
            inner
                .uplink_sessions
                .with_mut(session_id, |s| s.state = UplinkSessionState::ProgressingUplink);
        }
        NodeManagerEvent::UplinkSent { session_id, confirmed } => {
            let ack_unconfirmed = inner.config.gateway.ack_unconfirmed_uplinks;
            let should_ack = confirmed || ack_unconfirmed;
            let session_info = inner
                .uplink_sessions
                .with(session_id, |s| (s.transceiver, s.dev_addr, s.fcnt, s.message_type));

            inner
                .uplink_sessions
                .with_mut(session_id, |s| s.state = UplinkSessionState::UplinkSent);

            if should_ack {
                if let Some((transceiver, dev_addr, fcnt, message_type)) = session_info {
                    let mhdr = message_type_to_mhdr(message_type);
                    let frame = build_ack_frame(mhdr, dev_addr, fcnt);
                    let packet = TxPacket {
                        freq_mhz: 869.525,
                        datr: "SF12BW125".to_string(),
                        codr: "4/5".to_string(),
                        immediate: false,
                        payload: frame.to_vec(),
                        downlink_session_id: 0,
                    };
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        spawn_downlink_receive(inner, transceiver, dev_addr, packet, DownlinkOrigin::SelfAck)
                            .await;
                    });
                }
            }
        }
        NodeManagerEvent::UplinkFailed { session_id } => {
            inner
                .uplink_sessions
                .with_mut(session_id, |s| s.state = UplinkSessionState::UplinkFailed);
        }
    }
}

fn message_type_to_mhdr(message_type: MessageType) -> u8 {
    match message_type {
        MessageType::ConfirmedUplink => 0x80,
        _ => 0x40,
    }
}

/// §4.1 "Downlink-receive path", invoked for both server-initiated
/// (PULL_RESP) and self-generated ACK frames.
async fn spawn_downlink_receive(
    inner: Arc<Inner>,
    transceiver: TransceiverHandle,
    dev_addr: u32,
    mut packet: TxPacket,
    origin: DownlinkOrigin,
) {
    let session = DownlinkSession {
        transceiver,
        dev_addr,
        state: DownlinkSessionState::Scheduling,
    };
    let Ok(id) = inner.downlink_sessions.allocate_writing(session) else {
        warn!(dev_addr, "downlink session pool exhausted");
        if let DownlinkOrigin::Server { protocol_msg_id } = origin {
            let _ = inner
                .downlink_outcomes
                .send(DownlinkOutcome {
                    protocol_msg_id,
                    result: Err(ScheduleError::TooLate),
                })
                .await;
        }
        return;
    };
    inner.downlink_sessions.mark_ready(id);

    let downlink_session_id = id.to_u64();
    packet.downlink_session_id = downlink_session_id;
    inner
        .downlink_origins
        .lock()
        .await
        .insert(downlink_session_id, origin);

    let now = crate::transceiver::now_ms();
    match inner
        .realtime_sender
        .schedule_send(dev_addr, downlink_session_id, packet, now)
        .await
    {
        Ok(()) => {
            inner
                .downlink_sessions
                .with_mut(id, |s| s.state = DownlinkSessionState::Scheduled);
        }
        Err(error) => {
            inner.downlink_sessions.release(id);
            let origin = inner.downlink_origins.lock().await.remove(&downlink_session_id);
            if let Some(DownlinkOrigin::Server { protocol_msg_id }) = origin {
                let _ = inner
                    .downlink_outcomes
                    .send(DownlinkOutcome {
                        protocol_msg_id,
                        result: Err(error),
                    })
                    .await;
            }
        }
    }
}

fn sweep_sessions(inner: &Arc<Inner>, now_ms: u64) {
    for id in inner.uplink_sessions.ready_ids() {
        let snapshot = inner
            .uplink_sessions
            .with(id, |s| (s.state, s.rx_timestamp_ms, s.message_type));
        let Some((state, rx_timestamp_ms, message_type)) = snapshot else {
            continue;
        };
        let horizon = if message_type.is_join_request() {
            rx_timestamp_ms + JOIN_ACCEPT_DELAY2_MS + RX_WINDOW_LENGTH_MS
        } else {
            rx_timestamp_ms + RECEIVE_DELAY2_MS + RX_WINDOW_LENGTH_MS
        };

        let destroy = matches!(
            state,
            UplinkSessionState::UplinkSent | UplinkSessionState::UplinkFailed
        ) || (now_ms > horizon
            && state == UplinkSessionState::ProgressingUplink
            && !message_type.is_confirmed());

        if destroy {
            inner.uplink_sessions.release(id);
        } else if now_ms > horizon && state == UplinkSessionState::ProgressingUplink {
            warn!(index = id.index, "confirmed uplink window expired without downlink sent");
        }
    }
}

/// ACK_TIMEOUT: uniform random in [1000, 3000] ms (§4.1 constants).
pub fn ack_timeout_ms() -> u64 {
    rand::thread_rng().gen_range(1000..=3000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_to_mhdr_marks_confirmed_uplinks() {
        assert_eq!(message_type_to_mhdr(MessageType::ConfirmedUplink), 0x80);
        assert_eq!(message_type_to_mhdr(MessageType::UnconfirmedUplink), 0x40);
    }

    #[test]
    fn ack_timeout_is_within_spec_bounds() {
        for _ in 0..100 {
            let t = ack_timeout_ms();
            assert!((1000..=3000).contains(&t));
        }
    }
}
