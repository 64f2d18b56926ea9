//! Error taxonomy for the gateway's protocol engine.
//!
//! Component-local errors are typed enums (this module) so callers can
//! match on a specific failure and react (drop a frame, cancel a
//! schedule, release a slot) rather than stringly-typed errors bubbling
//! up. The CLI/config boundary still uses `anyhow`, matching
//! `main.rs`/`config.rs`.

use thiserror::Error;

/// Pool exhaustion: no free slot was available.
///
/// A single allocation failure is recoverable (drop the
/// frame, bump a missed-frame counter); only persistent exhaustion is
/// escalated by the owning component into its `error` automaton state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("pool exhausted")]
pub struct PoolError;

/// Errors the Protocol Engine can return while building or parsing GWMP
/// messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `SESSIONERROR_MESSAGE`: malformed input, wrong protocol version,
    /// truncated header, or invalid JSON body. The datagram is discarded.
    #[error("malformed protocol message: {0}")]
    Malformed(String),

    /// `SESSIONERROR_TRANSACTION`: the token in an ACK no longer
    /// resolves to a live transaction (expired, already released, or the
    /// pool slot was reused for a different message-id).
    #[error("stale or collided transaction for token 0x{0:04x}")]
    StaleTransaction(u16),

    /// No free transaction slot; the uplink message could not be built.
    #[error("transaction pool exhausted")]
    TransactionPoolExhausted,
}

/// Result codes the Realtime Sender returns from `schedule_send`,
/// matching the Semtech TX_ACK `error` reasons 1:1 so a `ScheduleError`
/// can be serialized into a `txpk_ack.error` string and parsed back.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// Rejected: already too late to program this packet for downlink.
    #[error("TOO_LATE")]
    TooLate,
    /// Rejected: downlink timestamp is too far in advance.
    #[error("TOO_EARLY")]
    TooEarly,
    /// Rejected: a packet is already programmed in the requested
    /// timeframe.
    #[error("COLLISION_PACKET")]
    CollisionPacket,
    /// Rejected: a beacon is already planned in the requested timeframe.
    #[error("COLLISION_BEACON")]
    CollisionBeacon,
    /// Rejected: requested frequency unsupported by the TX RF chain.
    #[error("TX_FREQ")]
    TxFreq,
    /// Rejected: requested power unsupported by the gateway.
    #[error("TX_POWER")]
    TxPower,
    /// Rejected: GPS unlocked, so the GPS timestamp cannot be used.
    #[error("GPS_UNLOCKED")]
    GpsUnlocked,
}

impl ScheduleError {
    /// The exact Semtech `txpk_ack.error` string for this rejection.
    pub fn as_txpk_ack_str(self) -> &'static str {
        match self {
            ScheduleError::TooLate => "TOO_LATE",
            ScheduleError::TooEarly => "TOO_EARLY",
            ScheduleError::CollisionPacket => "COLLISION_PACKET",
            ScheduleError::CollisionBeacon => "COLLISION_BEACON",
            ScheduleError::TxFreq => "TX_FREQ",
            ScheduleError::TxPower => "TX_POWER",
            ScheduleError::GpsUnlocked => "GPS_UNLOCKED",
        }
    }

    /// Parse a Semtech `txpk_ack.error` string back into a `ScheduleError`.
    pub fn from_txpk_ack_str(s: &str) -> Option<Self> {
        match s {
            "TOO_LATE" => Some(ScheduleError::TooLate),
            "TOO_EARLY" => Some(ScheduleError::TooEarly),
            "COLLISION_PACKET" => Some(ScheduleError::CollisionPacket),
            "COLLISION_BEACON" => Some(ScheduleError::CollisionBeacon),
            "TX_FREQ" => Some(ScheduleError::TxFreq),
            "TX_POWER" => Some(ScheduleError::TxPower),
            "GPS_UNLOCKED" => Some(ScheduleError::GpsUnlocked),
            _ => None,
        }
    }
}

/// Session-local failures surfaced by the Node/Server Manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `SESSIONEVENT_SENDFAILED`: the transport rejected the datagram.
    /// Terminal for the transaction.
    #[error("transport send failed: {0}")]
    TransportFailure(String),

    /// A session field was observed mutated outside its owning worker.
    /// Not recoverable; the owning component aborts.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_error_round_trips_through_txpk_ack_string() {
        for err in [
            ScheduleError::TooLate,
            ScheduleError::TooEarly,
            ScheduleError::CollisionPacket,
            ScheduleError::CollisionBeacon,
            ScheduleError::TxFreq,
            ScheduleError::TxPower,
            ScheduleError::GpsUnlocked,
        ] {
            let s = err.as_txpk_ack_str();
            assert_eq!(ScheduleError::from_txpk_ack_str(s), Some(err));
        }
    }

    #[test]
    fn unknown_txpk_ack_string_is_not_a_schedule_error() {
        assert_eq!(ScheduleError::from_txpk_ack_str("NONE"), None);
        assert_eq!(ScheduleError::from_txpk_ack_str("bogus"), None);
    }
}
