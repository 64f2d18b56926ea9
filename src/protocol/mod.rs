//! The Semtech GWMP codec and transaction correlator (§4.3).

pub mod engine;
pub mod json;
pub mod wire;

pub use engine::{
    DownlinkPacketDescription, GatewayStats, HeartbeatPeriods, ProtocolEngine, ServerEvent,
    SessionEvent, UplinkRequest,
};
pub use wire::{GatewayEui, Identifier, InboundMessage, OutboundMessage, PROTOCOL_VERSION};
