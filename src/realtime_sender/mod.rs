//! JIT downlink scheduler (§4.2).
//!
//! Translates "node just sent uplink U" into "this downlink must fire
//! between T1 and T2 on transceiver R" (§4.2). The original's counting
//! semaphore + mutex-guarded array become a `tokio::sync::Notify` plus a
//! `tokio::sync::Mutex` around a fixed-capacity `Vec<Option<_>>`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Duration;

use crate::error::ScheduleError;
use crate::transceiver::{LoraTransceiver, TransceiverHandle, TxPacket};

pub const CLASSA_RECEIVE_DELAY1_MS: u64 = 1000;
pub const CLASSA_RECEIVE_DELAY2_MS: u64 = 2000;
pub const RX_WINDOW_LENGTH_MS: u64 = 900;
pub const GATEWAY_TX_DELAY_MS: u64 = 100;
const EXPIRY_SWEEP_POLL_MS: u64 = 500;
const DRAIN_POLL_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    A,
    C,
}

/// A node's Class-A receive windows, registered after an uplink (§4.2
/// `register_node_rx_windows`).
#[derive(Debug, Clone, Copy)]
struct NodeReceiveWindow {
    dev_addr: u32,
    transceiver: TransceiverHandle,
    rx1: u64,
    rx2: u64,
}

impl NodeReceiveWindow {
    fn rx1_deadline(&self) -> u64 {
        self.rx1 + RX_WINDOW_LENGTH_MS - GATEWAY_TX_DELAY_MS
    }

    fn rx2_deadline(&self) -> u64 {
        self.rx2 + RX_WINDOW_LENGTH_MS - GATEWAY_TX_DELAY_MS
    }

    fn expired_at(&self) -> u64 {
        self.rx2 + RX_WINDOW_LENGTH_MS - GATEWAY_TX_DELAY_MS
    }

    /// Raw RX2-window-elapsed instant, with no gateway TX-delay
    /// adjustment — used only to reject a conflicting re-registration
    /// (§4.2), never for the sweep/schedule deadlines above.
    fn rx2_window_elapsed_at(&self) -> u64 {
        self.rx2 + RX_WINDOW_LENGTH_MS
    }
}

/// A downlink queued for dispatch on a transceiver.
#[derive(Debug, Clone)]
struct RealtimeLoraPacket {
    dev_addr: u32,
    downlink_session_id: u64,
    transceiver: TransceiverHandle,
    packet: TxPacket,
    asap: bool,
    send_timestamp: u64,
    ready: bool,
}

/// Events the Realtime Sender publishes back to the Node Manager (§4.1
/// `session_event` kinds `downlink-scheduled`/`downlink-sending`/
/// `downlink-failed`).
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    DownlinkScheduled { downlink_session_id: u64 },
    DownlinkSending { downlink_session_id: u64 },
    DownlinkFailed { downlink_session_id: u64, error: ScheduleError },
}

struct Inner {
    windows: Mutex<Vec<Option<NodeReceiveWindow>>>,
    packets: Mutex<Vec<Option<RealtimeLoraPacket>>>,
    notify: Notify,
    events: mpsc::Sender<RealtimeEvent>,
}

/// Handle shared between the Node Manager (which calls
/// `register_node_rx_windows`/`schedule_send`) and the sender task (which
/// owns the dispatch loop).
#[derive(Clone)]
pub struct RealtimeSender {
    inner: Arc<Inner>,
}

impl RealtimeSender {
    /// Returns the sender plus the event channel the Node Manager's
    /// "server task" should drain for `downlink-scheduled`/
    /// `downlink-sending`/`downlink-failed` notifications (§4.1).
    pub fn new(max_nodes: usize) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        let sender = Self {
            inner: Arc::new(Inner {
                windows: Mutex::new(vec![None; max_nodes]),
                packets: Mutex::new(vec![None; max_nodes]),
                notify: Notify::new(),
                events,
            }),
        };
        (sender, events_rx)
    }

    /// The transceiver currently holding the latest registered Class-A
    /// window for `dev_addr`, if any — used to resolve which radio
    /// should carry a server-initiated downlink before a
    /// `DownlinkSession` exists for it.
    pub async fn transceiver_for(&self, dev_addr: u32) -> Option<TransceiverHandle> {
        let windows = self.inner.windows.lock().await;
        windows
            .iter()
            .flatten()
            .filter(|w| w.dev_addr == dev_addr)
            .max_by_key(|w| w.rx1)
            .map(|w| w.transceiver)
    }

    /// §4.2 `register_node_rx_windows`. Class C is not supported in this
    /// scope and always fails.
    pub async fn register_node_rx_windows(
        &self,
        class: DeviceClass,
        dev_addr: u32,
        transceiver: TransceiverHandle,
        rx_timestamp: u64,
    ) -> Result<(), ScheduleError> {
        if class != DeviceClass::A {
            return Err(ScheduleError::TooEarly);
        }
        let mut windows = self.inner.windows.lock().await;

        // Reject a second uplink for the same node while its prior window
        // is still live and this one claims to predate that window's
        // horizon — a protocol violation (§4.2).
        let violates = windows
            .iter()
            .flatten()
            .any(|w| w.dev_addr == dev_addr && rx_timestamp < w.rx2_window_elapsed_at());
        if violates {
            return Err(ScheduleError::TooEarly);
        }

        let slot = windows
            .iter_mut()
            .find(|w| w.is_none())
            .ok_or(ScheduleError::CollisionPacket)?;
        *slot = Some(NodeReceiveWindow {
            dev_addr,
            transceiver,
            rx1: rx_timestamp + CLASSA_RECEIVE_DELAY1_MS,
            rx2: rx_timestamp + CLASSA_RECEIVE_DELAY2_MS,
        });
        Ok(())
    }

    /// §4.2 `schedule_send`.
    pub async fn schedule_send(
        &self,
        dev_addr: u32,
        downlink_session_id: u64,
        mut packet: TxPacket,
        now_ms: u64,
    ) -> Result<(), ScheduleError> {
        let window = {
            let windows = self.inner.windows.lock().await;
            windows
                .iter()
                .flatten()
                .filter(|w| w.dev_addr == dev_addr)
                .max_by_key(|w| w.rx1)
                .copied()
                .ok_or(ScheduleError::TooLate)?
        };

        let (send_timestamp, transceiver) = if now_ms < window.rx1_deadline() {
            (window.rx1_deadline(), window.transceiver)
        } else if now_ms < window.rx2_deadline() {
            (window.rx2_deadline(), window.transceiver)
        } else {
            return Err(ScheduleError::TooLate);
        };

        packet.downlink_session_id = downlink_session_id;
        let mut packets = self.inner.packets.lock().await;
        let slot = packets
            .iter_mut()
            .find(|p| p.is_none())
            .ok_or(ScheduleError::CollisionPacket)?;
        *slot = Some(RealtimeLoraPacket {
            dev_addr,
            downlink_session_id,
            transceiver,
            packet,
            asap: true,
            send_timestamp,
            ready: true,
        });
        drop(packets);
        self.inner.notify.notify_one();
        let _ = self
            .inner
            .events
            .send(RealtimeEvent::DownlinkScheduled { downlink_session_id })
            .await;
        Ok(())
    }

    async fn sweep_expired_windows(&self, now_ms: u64) {
        let mut windows = self.inner.windows.lock().await;
        for slot in windows.iter_mut() {
            if let Some(w) = slot {
                if w.expired_at() < now_ms {
                    *slot = None;
                }
            }
        }
    }

    async fn pick_next(&self) -> Option<(usize, RealtimeLoraPacket)> {
        let packets = self.inner.packets.lock().await;
        packets
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.clone().map(|p| (i, p)))
            .filter(|(_, p)| p.ready)
            .min_by_key(|(_, p)| (!p.asap, p.send_timestamp))
    }

    async fn take(&self, index: usize) -> Option<RealtimeLoraPacket> {
        let mut packets = self.inner.packets.lock().await;
        packets.get_mut(index).and_then(|slot| slot.take())
    }

    /// The sender task loop (§4.2 "Sender task loop"). `clock` returns the
    /// current monotonic millisecond time; `transceivers` maps each bound
    /// radio's handle to its driver.
    pub async fn run(
        self,
        transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>>,
        clock: impl Fn() -> u64,
    ) {
        let events = self.inner.events.clone();
        let mut draining = false;
        loop {
            let poll_ms = if draining { DRAIN_POLL_MS } else { EXPIRY_SWEEP_POLL_MS };
            let timed_out = tokio::select! {
                _ = self.inner.notify.notified() => false,
                _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => true,
            };

            if timed_out && !draining {
                self.sweep_expired_windows(clock()).await;
                continue;
            }

            match self.pick_next().await {
                None => {
                    draining = false;
                    continue;
                }
                Some((index, candidate)) => {
                    draining = true;
                    if !candidate.asap {
                        let now = clock();
                        if candidate.send_timestamp > now {
                            tokio::time::sleep(Duration::from_millis(
                                candidate.send_timestamp - now,
                            ))
                            .await;
                        }
                    }
                    let Some(packet) = self.take(index).await else {
                        continue;
                    };
                    let Some(transceiver) = transceivers.get(&packet.transceiver) else {
                        let _ = events
                            .send(RealtimeEvent::DownlinkFailed {
                                downlink_session_id: packet.downlink_session_id,
                                error: ScheduleError::TxFreq,
                            })
                            .await;
                        continue;
                    };
                    match transceiver.send(packet.packet.clone()).await {
                        Ok(()) => {
                            let _ = events
                                .send(RealtimeEvent::DownlinkSending {
                                    downlink_session_id: packet.downlink_session_id,
                                })
                                .await;
                        }
                        Err(_) => {
                            let _ = events
                                .send(RealtimeEvent::DownlinkFailed {
                                    downlink_session_id: packet.downlink_session_id,
                                    error: ScheduleError::TxFreq,
                                })
                                .await;
                        }
                    }
                }
            }
        }
    }
}
