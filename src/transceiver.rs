//! The `LoraTransceiver` device interface.
//!
//! Models the SX1276 SPI driver, out of scope here (§1). Per
//! DESIGN NOTES §9, ISR-driven radio events are replaced with a
//! device-interface trait whose implementations include both a real
//! SPI-backed driver (not provided in this scope — the crate only needs
//! the trait boundary) and `SimTransceiver`, a deterministic test double
//! that lets unit/integration tests drive `packet-received`/
//! `packet-sent` events without real interrupts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::TransceiverConfig;

/// Stable handle identifying one bound transceiver; cheap to copy and
/// compare, used by sessions/windows to remember "which radio received
/// this."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransceiverHandle(pub usize);

/// Raw metadata captured alongside a received frame.
#[derive(Debug, Clone)]
pub struct RxMetadata {
    pub freq_mhz: f64,
    pub datr: String,
    pub codr: String,
    pub snr: f64,
    pub rssi: f64,
}

/// A LoRa packet ready to transmit: radio settings plus payload.
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub freq_mhz: f64,
    pub datr: String,
    pub codr: String,
    pub immediate: bool,
    pub payload: Vec<u8>,
    /// Correlator echoed back on `RadioEvent::PacketSent`, standing in
    /// for "carries the originally submitted packet reference" (§6) —
    /// a packed `PoolId` (see `pool::PoolId::to_u64`) naming the
    /// `DownlinkSession` this packet belongs to. Zero for packets built
    /// outside the downlink-session path (none in this crate; present
    /// for callers that don't need correlation).
    pub downlink_session_id: u64,
}

/// Events the transceiver publishes to its caller-supplied channel.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A frame arrived. Carries the handle identifying which radio
    /// received it, the payload, reception timestamp (monotonic ms) and
    /// RX metadata.
    PacketReceived {
        transceiver: TransceiverHandle,
        payload: Vec<u8>,
        rx_timestamp_ms: u64,
        metadata: RxMetadata,
    },
    /// A previously submitted `send()` completed on the air. Carries back
    /// the `downlink_session_id` of the `TxPacket` that was submitted, so
    /// the Node Manager can resolve which `DownlinkSession` just finished.
    PacketSent {
        transceiver: TransceiverHandle,
        downlink_session_id: u64,
    },
}

/// The capability surface consumed from the radio driver (§6 External
/// Interfaces, Transceiver interface).
#[async_trait::async_trait]
pub trait LoraTransceiver: Send + Sync {
    fn handle(&self) -> TransceiverHandle;

    async fn initialize(&self, config: &TransceiverConfig) -> anyhow::Result<()>;

    async fn standby(&self) -> anyhow::Result<()>;

    /// Switch to continuous receive mode.
    async fn receive(&self) -> anyhow::Result<()>;

    /// Submit a packet for transmission. Returns once accepted by the
    /// radio (not once actually on air — that is reported later via
    /// `RadioEvent::PacketSent`).
    async fn send(&self, packet: TxPacket) -> anyhow::Result<()>;
}

/// A monotonic millisecond clock, injected so tests can control time.
/// The real implementation reads a steady clock; `SimTransceiver`'s
/// tests typically supply timestamps explicitly instead.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Deterministic in-memory transceiver double used by tests (and by the
/// bundled `network-server-sim` harness). Lets the test drive
/// `packet-received` on demand and observes `send()` calls without any
/// real radio.
pub struct SimTransceiver {
    handle: TransceiverHandle,
    events: mpsc::Sender<RadioEvent>,
    sent: Arc<std::sync::Mutex<Vec<TxPacket>>>,
    pending: Arc<std::sync::Mutex<std::collections::VecDeque<u64>>>,
    send_counter: AtomicU64,
}

impl SimTransceiver {
    pub fn new(handle: TransceiverHandle, events: mpsc::Sender<RadioEvent>) -> Self {
        Self {
            handle,
            events,
            sent: Arc::new(std::sync::Mutex::new(Vec::new())),
            pending: Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new())),
            send_counter: AtomicU64::new(0),
        }
    }

    /// Inject a `packet-received` event as if the radio had picked up a
    /// frame.
    pub async fn inject_received(
        &self,
        payload: Vec<u8>,
        rx_timestamp_ms: u64,
        metadata: RxMetadata,
    ) {
        let _ = self
            .events
            .send(RadioEvent::PacketReceived {
                transceiver: self.handle,
                payload,
                rx_timestamp_ms,
                metadata,
            })
            .await;
    }

    /// Simulate the radio completing the oldest still-in-flight
    /// transmission, echoing back its `downlink_session_id`.
    pub async fn complete_send(&self) {
        let Some(downlink_session_id) = self.pending.lock().unwrap().pop_front() else {
            return;
        };
        let _ = self
            .events
            .send(RadioEvent::PacketSent {
                transceiver: self.handle,
                downlink_session_id,
            })
            .await;
    }

    pub fn sent_packets(&self) -> Vec<TxPacket> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> u64 {
        self.send_counter.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LoraTransceiver for SimTransceiver {
    fn handle(&self) -> TransceiverHandle {
        self.handle
    }

    async fn initialize(&self, _config: &TransceiverConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn standby(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, packet: TxPacket) -> anyhow::Result<()> {
        self.send_counter.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().push_back(packet.downlink_session_id);
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }
}
