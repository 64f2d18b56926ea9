//! The Semtech packet-forwarder codec and transaction correlator (§4.3).
//!
//! Grounded in `original_source/main/include/SemtechProtocolEngine.h` for
//! the transaction pool sizing and message-id encoding, and
//! `original_source/main/SemtechProtocolEngine.c` for the
//! build/process/session-event algorithms. The transaction pool itself is
//! `crate::pool::Pool`, not the original's raw `CMemoryBlockArray` — see
//! DESIGN.md for the addressing fix this implies.

use std::sync::Mutex;

use crate::error::ProtocolError;
use crate::pool::{Pool, PoolId};

use super::json::{PullRespBody, Rxpk, Stat, TxAckBody, TxpkAckBody};
use super::wire::{GatewayEui, Identifier, InboundMessage, OutboundMessage};

/// What kind of uplink datagram `build_uplink` should attempt.
#[derive(Debug, Clone)]
pub enum UplinkRequest {
    /// A freshly received LoRa frame: always sent.
    LoraData { rxpk: Vec<Rxpk> },
    /// A keepalive tick: consults the PUSHSTAT/PULLDATA timers unless
    /// `force` is set.
    Heartbeat { force: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionSubType {
    PushData,
    PullData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Sending,
    Sent,
}

/// One uplink protocol message awaiting ACK (§3 "ProtocolTransaction").
struct ProtocolTransaction {
    message_id: u16,
    /// HIWORD of the 32-bit composite `protocol_msg_id` (§3: "allowing
    /// both layers to recover their local descriptors") — the Server
    /// Manager's own descriptor for the uplink this transaction carries,
    /// recovered here when an ACK for it arrives bearing only the raw
    /// 16-bit wire token.
    server_manager_msg_id: u32,
    sub_type: TransactionSubType,
    is_heartbeat: bool,
    state: TransactionState,
}

/// A parsed downlink instruction handed to the Node Manager after a
/// PULL_RESP (§4.3 "instantiates a new downlink transaction and produces
/// a LoraPacket description").
#[derive(Debug, Clone)]
pub struct DownlinkPacketDescription {
    pub freq_mhz: f64,
    pub datr: String,
    pub codr: String,
    pub immediate: bool,
    pub tmst: Option<u64>,
    pub payload: Vec<u8>,
}

/// Outcome of `process_server_message`.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// PUSH_ACK/PULL_ACK for a live uplink transaction: the Server Manager
    /// may now release its session.
    UplinkTerminated { protocol_msg_id: u32 },
    /// PULL_RESP: a downlink to hand to the Node Manager.
    Downlink {
        protocol_msg_id: u32,
        packet: DownlinkPacketDescription,
    },
}

/// Events fed into `process_session_event` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Sent,
    SendFailed,
    Released,
    Canceled,
}

/// Gateway-wide counters maintained by the engine, emitted verbatim into
/// the periodic `stat` JSON body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayStats {
    pub rxnb: u64,
    pub rxok: u64,
    pub rxfw: u64,
    pub upnb: u64,
    pub ackr_count: u64,
    pub dwnb: u64,
    pub txnb: u64,
}

impl GatewayStats {
    /// `ackr = 100 * ackr_count / upnb` (100% when `upnb == 0`).
    pub fn ackr(&self) -> f64 {
        if self.upnb == 0 {
            100.0
        } else {
            super::json::round1(100.0 * self.ackr_count as f64 / self.upnb as f64)
        }
    }
}

struct Timers {
    last_pushdata_stat_ms: Option<u64>,
    last_pulldata_ms: Option<u64>,
}

/// Configurable keepalive periods (§4.3, default ~60s/~100s).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPeriods {
    pub pushstat_period_ms: u64,
    pub pulldata_period_ms: u64,
}

pub struct ProtocolEngine {
    gateway_eui: GatewayEui,
    transactions: Pool<ProtocolTransaction>,
    index_bits: u32,
    counter: Mutex<u16>,
    timers: Mutex<Timers>,
    stats: Mutex<GatewayStats>,
    periods: HeartbeatPeriods,
}

impl ProtocolEngine {
    /// `transaction_id_bits` is `N`: the transaction pool holds `2^N`
    /// slots and every outstanding message-id's low `N` bits are its pool
    /// index (§4.3 "Transaction-id encoding rationale").
    pub fn new(
        gateway_eui: GatewayEui,
        transaction_id_bits: u8,
        periods: HeartbeatPeriods,
    ) -> Self {
        let capacity = 1usize << transaction_id_bits;
        Self {
            gateway_eui,
            transactions: Pool::with_capacity(capacity),
            index_bits: transaction_id_bits as u32,
            counter: Mutex::new(1),
            timers: Mutex::new(Timers {
                last_pushdata_stat_ms: None,
                last_pulldata_ms: None,
            }),
            stats: Mutex::new(GatewayStats::default()),
            periods,
        }
    }

    pub fn stats(&self) -> GatewayStats {
        *self.stats.lock().unwrap()
    }

    /// Bump `txnb` when a downlink actually reaches the air (§4.3 "stat
    /// JSON fields"). Called by the Server Manager once the Node Manager
    /// reports a `downlink-sent` outcome for a PULL_RESP-originated
    /// downlink.
    pub fn record_downlink_sent(&self) {
        self.stats.lock().unwrap().txnb += 1;
    }

    fn mask(&self) -> u16 {
        ((1u32 << self.index_bits) - 1) as u16
    }

    /// Next `(counter << N) | transaction_index`, counter skipping zero
    /// and wrapping at `2^(16-N)`.
    fn next_message_id(&self, transaction_index: usize) -> u16 {
        let mut counter = self.counter.lock().unwrap();
        let max_counter = 0xFFFFu16 >> self.index_bits;
        let value = (*counter << self.index_bits) | (transaction_index as u16 & self.mask());
        *counter = if *counter >= max_counter { 1 } else { *counter + 1 };
        value
    }

    /// Build the next uplink datagram, or `None` if a heartbeat tick has
    /// nothing due yet (§4.3 "Else return false").
    pub fn build_uplink(
        &self,
        request: UplinkRequest,
        server_manager_msg_id: u32,
        now_ms: u64,
    ) -> Result<Option<(OutboundMessage, u32)>, ProtocolError> {
        match request {
            UplinkRequest::LoraData { rxpk } => {
                let mut stats = self.stats.lock().unwrap();
                stats.rxnb += 1;
                stats.rxok += 1;
                drop(stats);
                let json = serde_json::to_string(&super::json::PushDataRxpk { rxpk: &rxpk })
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                self.allocate_push(json, false, server_manager_msg_id, now_ms)
                    .map(Some)
            }
            UplinkRequest::Heartbeat { force } => {
                if force {
                    return self
                        .build_stat_uplink(server_manager_msg_id, now_ms)
                        .map(Some);
                }
                let timers = self.timers.lock().unwrap();
                let pushstat_due = timers
                    .last_pushdata_stat_ms
                    .map(|t| now_ms.saturating_sub(t) >= self.periods.pushstat_period_ms)
                    .unwrap_or(true);
                let pulldata_due = timers
                    .last_pulldata_ms
                    .map(|t| now_ms.saturating_sub(t) >= self.periods.pulldata_period_ms)
                    .unwrap_or(true);
                drop(timers);

                if pushstat_due {
                    self.build_stat_uplink(server_manager_msg_id, now_ms)
                        .map(Some)
                } else if pulldata_due {
                    self.allocate_pulldata(server_manager_msg_id, now_ms)
                        .map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn build_stat_uplink(
        &self,
        server_manager_msg_id: u32,
        now_ms: u64,
    ) -> Result<(OutboundMessage, u32), ProtocolError> {
        let stat = {
            let stats = self.stats.lock().unwrap();
            Stat {
                time: stat_timestamp(now_ms),
                lati: 0.0,
                long: 0.0,
                alti: 0,
                rxnb: stats.rxnb,
                rxok: stats.rxok,
                rxfw: stats.rxfw,
                ackr: stats.ackr(),
                dwnb: stats.dwnb,
                txnb: stats.txnb,
            }
        };
        let json = serde_json::to_string(&super::json::PushDataStat { stat: &stat })
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.timers.lock().unwrap().last_pushdata_stat_ms = Some(now_ms);
        self.allocate_push(json, true, server_manager_msg_id, now_ms)
    }

    fn allocate_push(
        &self,
        json: String,
        is_heartbeat: bool,
        server_manager_msg_id: u32,
        _now_ms: u64,
    ) -> Result<(OutboundMessage, u32), ProtocolError> {
        let id = self.allocate_transaction(TransactionSubType::PushData, is_heartbeat, server_manager_msg_id)?;
        let message_id = self.transactions.with(id, |t| t.message_id).unwrap();
        self.stats.lock().unwrap().upnb += 1;
        Ok((
            OutboundMessage::PushData {
                token: message_id,
                gateway_eui: self.gateway_eui,
                json,
            },
            self.protocol_msg_id(server_manager_msg_id, message_id),
        ))
    }

    fn allocate_pulldata(
        &self,
        server_manager_msg_id: u32,
        now_ms: u64,
    ) -> Result<(OutboundMessage, u32), ProtocolError> {
        let id = self.allocate_transaction(TransactionSubType::PullData, true, server_manager_msg_id)?;
        let message_id = self.transactions.with(id, |t| t.message_id).unwrap();
        self.timers.lock().unwrap().last_pulldata_ms = Some(now_ms);
        Ok((
            OutboundMessage::PullData {
                token: message_id,
                gateway_eui: self.gateway_eui,
            },
            self.protocol_msg_id(server_manager_msg_id, message_id),
        ))
    }

    fn allocate_transaction(
        &self,
        sub_type: TransactionSubType,
        is_heartbeat: bool,
        server_manager_msg_id: u32,
    ) -> Result<PoolId, ProtocolError> {
        // Reserve a slot first so the pool index is known before the
        // message-id (which embeds that index) is computed.
        let id = self
            .transactions
            .allocate_writing(ProtocolTransaction {
                message_id: 0,
                server_manager_msg_id,
                sub_type,
                is_heartbeat,
                state: TransactionState::Sending,
            })
            .map_err(|_| ProtocolError::TransactionPoolExhausted)?;
        let message_id = self.next_message_id(id.index);
        // `with_mut` only reaches slots already `Ready`; flip the slot
        // ready first, then fill in the message-id it needed its own
        // pool index to compute.
        self.transactions.mark_ready(id);
        self.transactions.with_mut(id, |t| t.message_id = message_id);
        Ok(id)
    }

    fn protocol_msg_id(&self, server_manager_msg_id: u32, message_id: u16) -> u32 {
        (server_manager_msg_id << 16) | message_id as u32
    }

    fn pool_id_from_token(&self, token: u16) -> PoolId {
        // The generation is resolved by scanning live ids for the matching
        // index; a non-matching generation means a stale/collided token.
        let index = (token & self.mask()) as usize;
        self.transactions
            .ready_ids()
            .into_iter()
            .find(|id| id.index == index)
            .unwrap_or(PoolId {
                index,
                generation: 0,
            })
    }

    /// Parse and correlate a datagram received from the Network Server.
    pub fn process_server_message(&self, data: &[u8]) -> Result<ServerEvent, ProtocolError> {
        let message = InboundMessage::parse(data)?;
        match message {
            InboundMessage::PushAck { token } | InboundMessage::PullAck { token } => {
                let id = self.pool_id_from_token(token);
                let server_manager_msg_id = self
                    .transactions
                    .with(id, |t| (t.message_id == token).then_some(t.server_manager_msg_id))
                    .flatten();
                let Some(server_manager_msg_id) = server_manager_msg_id else {
                    return Err(ProtocolError::StaleTransaction(token));
                };
                self.stats.lock().unwrap().ackr_count += 1;
                let protocol_msg_id = self.protocol_msg_id(server_manager_msg_id, token);
                Ok(ServerEvent::UplinkTerminated { protocol_msg_id })
            }
            InboundMessage::PullResp { token, json } => {
                let body: PullRespBody = serde_json::from_str(&json)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                let payload = body
                    .txpk
                    .decode_payload()
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                self.stats.lock().unwrap().dwnb += 1;
                let packet = DownlinkPacketDescription {
                    freq_mhz: body.txpk.freq,
                    datr: body.txpk.datr,
                    codr: body.txpk.codr,
                    immediate: body.txpk.imme,
                    tmst: body.txpk.tmst,
                    payload,
                };
                let protocol_msg_id = self.protocol_msg_id(0, token);
                Ok(ServerEvent::Downlink {
                    protocol_msg_id,
                    packet,
                })
            }
        }
    }

    /// Resolve a previously built uplink's outcome (§4.3
    /// `process_session_event`). `protocol_msg_id`'s low 16 bits name the
    /// transaction.
    pub fn process_session_event(&self, protocol_msg_id: u32, event: SessionEvent) {
        let token = (protocol_msg_id & 0xFFFF) as u16;
        let id = self.pool_id_from_token(token);
        let matches = self
            .transactions
            .with(id, |t| t.message_id == token)
            .unwrap_or(false);
        if !matches {
            return;
        }
        match event {
            SessionEvent::Sent => {
                let was_heartbeat = self
                    .transactions
                    .with_mut(id, |t| {
                        t.state = TransactionState::Sent;
                        t.is_heartbeat
                    })
                    .unwrap_or(true);
                let mut stats = self.stats.lock().unwrap();
                if !was_heartbeat {
                    stats.rxfw += 1;
                }
            }
            SessionEvent::SendFailed | SessionEvent::Canceled | SessionEvent::Released => {
                self.transactions.release(id);
            }
        }
    }

    /// Build the TX_ACK body for a downlink outcome (§4.3, §6 ScheduleError
    /// round-trip through the `txpk_ack.error` string).
    pub fn build_tx_ack(&self, token: u16, error: Option<crate::error::ScheduleError>) -> OutboundMessage {
        let json = error.map(|e| {
            serde_json::to_string(&TxAckBody {
                txpk_ack: &TxpkAckBody {
                    error: e.as_txpk_ack_str().to_string(),
                },
            })
            .expect("TxAckBody always serializes")
        });
        OutboundMessage::TxAck {
            token,
            gateway_eui: self.gateway_eui,
            json,
        }
    }
}

impl From<Identifier> for u8 {
    fn from(value: Identifier) -> Self {
        value as u8
    }
}

/// `stat.time`: 23-char `YYYY-MM-DD HH:MM:SS GMT` (§4.3).
fn stat_timestamp(now_ms: u64) -> String {
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now_ms as i64)
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());
    dt.format("%Y-%m-%d %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EUI: GatewayEui = [0x02, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x01];

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(
            EUI,
            3,
            HeartbeatPeriods {
                pushstat_period_ms: 60_000,
                pulldata_period_ms: 100_000,
            },
        )
    }

    fn sample_rxpk() -> Vec<Rxpk> {
        vec![Rxpk::new(
            1_000_000,
            "2026-07-31T00:00:00.000000Z".to_string(),
            0,
            0,
            868.1,
            "SF7BW125".to_string(),
            "4/5".to_string(),
            -80.0,
            7.5,
            &[0x40, 0, 0, 0, 0],
        )]
    }

    #[test]
    fn lora_data_always_builds_a_push_data() {
        let engine = engine();
        let (msg, _id) = engine
            .build_uplink(
                UplinkRequest::LoraData { rxpk: sample_rxpk() },
                1,
                1_000_000,
            )
            .unwrap()
            .unwrap();
        assert!(matches!(msg, OutboundMessage::PushData { .. }));
        assert_eq!(engine.stats().rxnb, 1);
        assert_eq!(engine.stats().rxok, 1);
    }

    #[test]
    fn heartbeat_without_traffic_emits_stat_first_tick() {
        let engine = engine();
        let result = engine
            .build_uplink(UplinkRequest::Heartbeat { force: false }, 1, 0)
            .unwrap();
        assert!(matches!(result, Some((OutboundMessage::PushData { .. }, _))));
    }

    #[test]
    fn heartbeat_returns_none_when_nothing_due() {
        let engine = engine();
        engine
            .build_uplink(UplinkRequest::Heartbeat { force: false }, 1, 0)
            .unwrap();
        let result = engine
            .build_uplink(UplinkRequest::Heartbeat { force: false }, 1, 1_000)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn forced_heartbeat_always_emits_stat() {
        let engine = engine();
        engine
            .build_uplink(UplinkRequest::Heartbeat { force: false }, 1, 0)
            .unwrap();
        let result = engine
            .build_uplink(UplinkRequest::Heartbeat { force: true }, 1, 1_000)
            .unwrap();
        assert!(matches!(result, Some((OutboundMessage::PushData { .. }, _))));
    }

    #[test]
    fn build_then_ack_terminates_the_uplink() {
        let engine = engine();
        let (msg, protocol_msg_id) = engine
            .build_uplink(
                UplinkRequest::LoraData { rxpk: sample_rxpk() },
                7,
                1_000_000,
            )
            .unwrap()
            .unwrap();
        let token = msg.token();
        let ack = [
            super::super::wire::PROTOCOL_VERSION,
            (token & 0xFF) as u8,
            (token >> 8) as u8,
            1,
        ];
        let event = engine.process_server_message(&ack).unwrap();
        match event {
            ServerEvent::UplinkTerminated { protocol_msg_id: pid } => {
                // The engine recovers the original server_manager_msg_id
                // (HIWORD=7) from the stored transaction, not just the
                // bare wire token.
                assert_eq!(pid, protocol_msg_id);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(engine.stats().ackr(), 100.0);
    }

    #[test]
    fn stale_ack_token_is_rejected() {
        let engine = engine();
        let bogus = [2u8, 0xFF, 0xFF, 1];
        assert!(matches!(
            engine.process_server_message(&bogus),
            Err(ProtocolError::StaleTransaction(_))
        ));
    }

    #[test]
    fn pull_resp_decodes_into_downlink_packet() {
        let engine = engine();
        let mut raw = vec![2u8, 0x01, 0x00, 3];
        raw.extend_from_slice(
            br#"{"txpk":{"imme":false,"tmst":1003000,"freq":868.1,"rfch":0,"powe":14,"modu":"LORA","datr":"SF7BW125","codr":"4/5","size":3,"data":"AQID"}}"#,
        );
        match engine.process_server_message(&raw).unwrap() {
            ServerEvent::Downlink { packet, .. } => {
                assert_eq!(packet.payload, vec![1, 2, 3]);
                assert_eq!(packet.freq_mhz, 868.1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(engine.stats().dwnb, 1);
    }

    #[test]
    fn sent_event_bumps_rxfw_for_non_heartbeat() {
        let engine = engine();
        let (msg, protocol_msg_id) = engine
            .build_uplink(
                UplinkRequest::LoraData { rxpk: sample_rxpk() },
                1,
                1_000_000,
            )
            .unwrap()
            .unwrap();
        let _ = msg;
        engine.process_session_event(protocol_msg_id, SessionEvent::Sent);
        assert_eq!(engine.stats().rxfw, 1);
    }

    #[test]
    fn token_never_reuses_a_live_index_after_wrap() {
        let engine = engine();
        let capacity = 1usize << 3;
        let mut tokens = Vec::new();
        for i in 0..capacity {
            let (msg, _) = engine
                .build_uplink(UplinkRequest::LoraData { rxpk: sample_rxpk() }, i as u32, 0)
                .unwrap()
                .unwrap();
            tokens.push(msg.token());
        }
        let unique: std::collections::HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), tokens.len());
    }
}
