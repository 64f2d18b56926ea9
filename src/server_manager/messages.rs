//! Descriptors the Server Manager pools while routing between the Node
//! Manager, Protocol Engine, and active Connector (§4.4).

use crate::pool::PoolId;

/// An uplink descriptor awaiting the Network Server's ACK.
#[derive(Debug, Clone)]
pub struct ServerUpMessage {
    pub uplink_session_id: PoolId,
    pub protocol_msg_id: u32,
    pub confirmed: bool,
}
