//! Uplink/downlink session records (§3 Data Model).

use crate::lorawan::MessageType;
use crate::transceiver::TransceiverHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkSessionState {
    Receiving,
    SendingUplink,
    ProgressingUplink,
    UplinkSent,
    UplinkFailed,
}

/// One uplink in flight between reception and the Server Manager's ACK
/// (§3 "UplinkSession").
#[derive(Debug, Clone)]
pub struct UplinkSession {
    pub transceiver: TransceiverHandle,
    pub dev_addr: u32,
    pub fcnt: u16,
    pub message_type: MessageType,
    pub rx_timestamp_ms: u64,
    pub state: UplinkSessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkSessionState {
    Scheduling,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

/// One downlink in flight between the decision to send it and its
/// delivery outcome (§3 "DownlinkSession").
#[derive(Debug, Clone)]
pub struct DownlinkSession {
    pub transceiver: TransceiverHandle,
    pub dev_addr: u32,
    pub state: DownlinkSessionState,
}
