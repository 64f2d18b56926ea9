//! GWMP byte framing (§4.3 "Wire format (all messages)").
//!
//! Generalizes `udp/protocol.rs::GwmpPacket`, which only parsed the
//! messages a Network Server receives, into a codec that also *builds*
//! the messages a gateway client sends (PUSH_DATA, PULL_DATA, TX_ACK) and
//! *parses* the messages it receives back (PUSH_ACK, PULL_ACK,
//! PULL_RESP). The token is little-endian here, not big-endian as
//! `bytes::Buf::get_u16`/`put_u16` default to — §4.3 is explicit:
//! "Bytes 1-2: little-endian token."

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

pub const PROTOCOL_VERSION: u8 = 2;

pub type GatewayEui = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Identifier {
    PushData = 0,
    PushAck = 1,
    PullData = 2,
    PullResp = 3,
    PullAck = 4,
    TxAck = 5,
}

impl TryFrom<u8> for Identifier {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Identifier::PushData),
            1 => Ok(Identifier::PushAck),
            2 => Ok(Identifier::PullData),
            3 => Ok(Identifier::PullResp),
            4 => Ok(Identifier::PullAck),
            5 => Ok(Identifier::TxAck),
            other => Err(ProtocolError::Malformed(format!(
                "unknown GWMP identifier byte 0x{other:02x}"
            ))),
        }
    }
}

/// A GWMP datagram this gateway builds and sends.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    PushData {
        token: u16,
        gateway_eui: GatewayEui,
        json: String,
    },
    PullData {
        token: u16,
        gateway_eui: GatewayEui,
    },
    TxAck {
        token: u16,
        gateway_eui: GatewayEui,
        json: Option<String>,
    },
}

impl OutboundMessage {
    pub fn token(&self) -> u16 {
        match self {
            OutboundMessage::PushData { token, .. }
            | OutboundMessage::PullData { token, .. }
            | OutboundMessage::TxAck { token, .. } => *token,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(PROTOCOL_VERSION);
        match self {
            OutboundMessage::PushData {
                token,
                gateway_eui,
                json,
            } => {
                buf.put_u16_le(*token);
                buf.put_u8(Identifier::PushData as u8);
                buf.put_slice(gateway_eui);
                buf.put_slice(json.as_bytes());
            }
            OutboundMessage::PullData { token, gateway_eui } => {
                buf.put_u16_le(*token);
                buf.put_u8(Identifier::PullData as u8);
                buf.put_slice(gateway_eui);
            }
            OutboundMessage::TxAck {
                token,
                gateway_eui,
                json,
            } => {
                buf.put_u16_le(*token);
                buf.put_u8(Identifier::TxAck as u8);
                buf.put_slice(gateway_eui);
                if let Some(json) = json {
                    buf.put_slice(json.as_bytes());
                }
            }
        }
        buf.to_vec()
    }
}

/// A GWMP datagram received from the Network Server.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    PushAck { token: u16 },
    PullAck { token: u16 },
    PullResp { token: u16, json: String },
}

impl InboundMessage {
    pub fn token(&self) -> u16 {
        match self {
            InboundMessage::PushAck { token }
            | InboundMessage::PullAck { token }
            | InboundMessage::PullResp { token, .. } => *token,
        }
    }

    /// Parse a raw datagram arriving from the Network Server.
    ///
    /// `MESSAGE` errors (per §7) on anything shorter than the 4-byte
    /// header, an unsupported protocol version, an unexpected identifier
    /// for an inbound message, or (for PULL_RESP) non-UTF8 body bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::Malformed(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Malformed(format!(
                "unsupported protocol version 0x{version:02x}"
            )));
        }
        let token = buf.get_u16_le();
        let identifier = Identifier::try_from(buf.get_u8())?;

        match identifier {
            Identifier::PushAck => Ok(InboundMessage::PushAck { token }),
            Identifier::PullAck => Ok(InboundMessage::PullAck { token }),
            Identifier::PullResp => {
                let json = String::from_utf8(buf.to_vec())
                    .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8 body: {e}")))?;
                Ok(InboundMessage::PullResp { token, json })
            }
            other => Err(ProtocolError::Malformed(format!(
                "unexpected inbound identifier {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EUI: GatewayEui = [0x02, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x01];

    #[test]
    fn push_data_round_trips_token_and_body_bytes() {
        let msg = OutboundMessage::PushData {
            token: 0x1234,
            gateway_eui: EUI,
            json: r#"{"rxpk":[]}"#.to_string(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        // little-endian token
        assert_eq!(bytes[1], 0x34);
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], Identifier::PushData as u8);
        assert_eq!(&bytes[4..12], &EUI);
        assert_eq!(&bytes[12..], br#"{"rxpk":[]}"#);
    }

    #[test]
    fn push_ack_parses_little_endian_token() {
        let bytes = [PROTOCOL_VERSION, 0x34, 0x12, Identifier::PushAck as u8];
        let msg = InboundMessage::parse(&bytes).unwrap();
        assert!(matches!(msg, InboundMessage::PushAck { token: 0x1234 }));
    }

    #[test]
    fn pull_resp_carries_json_body() {
        let mut bytes = vec![PROTOCOL_VERSION, 0x01, 0x00, Identifier::PullResp as u8];
        bytes.extend_from_slice(br#"{"txpk":{}}"#);
        match InboundMessage::parse(&bytes).unwrap() {
            InboundMessage::PullResp { token, json } => {
                assert_eq!(token, 1);
                assert_eq!(json, r#"{"txpk":{}}"#);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(InboundMessage::parse(&[PROTOCOL_VERSION, 0x00]).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let bytes = [0x01, 0x00, 0x00, Identifier::PushAck as u8];
        assert!(InboundMessage::parse(&bytes).is_err());
    }
}
