//! LoRaWAN MAC-header parsing and ACK-frame synthesis.
//!
//! Only the framing this gateway needs to touch is implemented: the MAC
//! Header byte, DevAddr and FCnt of a data frame (§3 `UplinkSession`),
//! and the 10-byte ACK downlink frame the Node Manager synthesizes for
//! confirmed uplinks (§4.1). FRMPayload encryption and MIC computation
//! are explicitly out of scope (§1 Non-goals) — payloads pass through
//! opaque.
//!
//! Follows `lorawan/mod.rs` (`MType` decode from the MHDR top 3 bits,
//! little-endian DevAddr/FCnt) and
//! `original_source/main/LoraNodeManager.c`
//! (`CLoraNodeManager_ProcessSessionEventUplinkSent`) for the exact
//! byte layout of the synthesized ACK frame.

use std::fmt;

/// The eight LoRaWAN message types, named per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    JoinRequest,
    JoinAccept,
    UnconfirmedUplink,
    UnconfirmedDownlink,
    ConfirmedUplink,
    ConfirmedDownlink,
    Rfu,
    Proprietary,
}

impl MessageType {
    /// Decode from the top 3 bits of an MHDR byte.
    pub fn from_mhdr(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MessageType::JoinRequest,
            0b001 => MessageType::JoinAccept,
            0b010 => MessageType::UnconfirmedUplink,
            0b011 => MessageType::UnconfirmedDownlink,
            0b100 => MessageType::ConfirmedUplink,
            0b101 => MessageType::ConfirmedDownlink,
            0b110 => MessageType::Rfu,
            0b111 => MessageType::Proprietary,
            _ => unreachable!("3-bit field"),
        }
    }

    pub fn is_uplink(self) -> bool {
        matches!(self, MessageType::ConfirmedUplink | MessageType::UnconfirmedUplink)
    }

    pub fn is_confirmed(self) -> bool {
        matches!(
            self,
            MessageType::ConfirmedUplink | MessageType::ConfirmedDownlink
        )
    }

    pub fn is_join_request(self) -> bool {
        matches!(self, MessageType::JoinRequest)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::JoinRequest => "join-request",
            MessageType::JoinAccept => "join-accept",
            MessageType::UnconfirmedUplink => "unconfirmed-uplink",
            MessageType::UnconfirmedDownlink => "unconfirmed-downlink",
            MessageType::ConfirmedUplink => "confirmed-uplink",
            MessageType::ConfirmedDownlink => "confirmed-downlink",
            MessageType::Rfu => "rfu",
            MessageType::Proprietary => "proprietary",
        };
        write!(f, "{s}")
    }
}

/// Error parsing a raw PHY payload's MAC header fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameParseError {
    #[error("empty PHY payload")]
    Empty,
    #[error("data frame too short: {0} bytes (minimum 8 for MHDR+DevAddr+FCtrl+FCnt)")]
    TooShort(usize),
}

/// The MHDR/DevAddr/FCnt fields the Node Manager needs from a received
/// frame (§4.1 step 3: "parse MHDR -> message-type, DevAddr, FCnt").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub mhdr: u8,
    pub message_type: MessageType,
    pub dev_addr: u32,
    pub fcnt: u16,
}

/// Parse the MAC header fields of a data frame (join-request/accept and
/// proprietary frames carry no DevAddr/FCnt and are reported with both
/// set to zero).
pub fn parse_frame_header(data: &[u8]) -> Result<FrameHeader, FrameParseError> {
    if data.is_empty() {
        return Err(FrameParseError::Empty);
    }
    let mhdr = data[0];
    let message_type = MessageType::from_mhdr(mhdr);

    if !matches!(
        message_type,
        MessageType::UnconfirmedUplink
            | MessageType::UnconfirmedDownlink
            | MessageType::ConfirmedUplink
            | MessageType::ConfirmedDownlink
    ) {
        return Ok(FrameHeader {
            mhdr,
            message_type,
            dev_addr: 0,
            fcnt: 0,
        });
    }

    // MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) = 8 bytes minimum.
    if data.len() < 8 {
        return Err(FrameParseError::TooShort(data.len()));
    }
    let dev_addr = u32::from_le_bytes(data[1..5].try_into().unwrap());
    let fcnt = u16::from_le_bytes(data[6..8].try_into().unwrap());

    Ok(FrameHeader {
        mhdr,
        message_type,
        dev_addr,
        fcnt,
    })
}

/// Build the 10-byte ACK downlink frame synthesized for a confirmed
/// uplink: `MHDR | DevAddr(LE,4) | FCtrl=0x10 | FCnt(LE,4)`.
///
/// The FCnt field here is written as a 4-byte little-endian value (not
/// the usual 2-byte LoRaWAN FCnt) — this mirrors the original firmware's
/// ad-hoc ACK payload layout exactly, which is what Network Servers in
/// this deployment expect on the wire.
pub fn build_ack_frame(mhdr: u8, dev_addr: u32, fcnt: u16) -> [u8; 10] {
    let mut frame = [0u8; 10];
    frame[0] = mhdr;
    frame[1..5].copy_from_slice(&dev_addr.to_le_bytes());
    frame[5] = 0x10; // FCtrl: ACK bit set
    frame[6..10].copy_from_slice(&(fcnt as u32).to_le_bytes());
    frame
}
