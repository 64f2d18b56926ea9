//! JSON bodies carried inside GWMP datagrams (§4.3 "`rxpk`/`stat` JSON
//! fields"), generalizing the `Rxpk`/`PushDataPayload` structs
//! (which only covered the receiving side of the protocol) to also build
//! the outbound `rxpk`/`stat`/`txpk_ack` bodies this gateway sends, and to
//! parse the `txpk` body a Network Server sends back in PULL_RESP.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One received LoRa frame, as emitted inside a PUSH_DATA `rxpk` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    pub tmst: u64,
    pub time: String,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub stat: i32,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i32,
    pub lsnr: f64,
    pub size: u16,
    pub data: String,
}

impl Rxpk {
    /// Build from a received frame's metadata. `rx_timestamp_ms` is the
    /// internal millisecond clock reading at RX-finished, per §4.3.
    pub fn new(
        rx_timestamp_ms: u64,
        time: String,
        chan: u8,
        rfch: u8,
        freq_mhz: f64,
        datr: String,
        codr: String,
        rssi: f64,
        snr: f64,
        payload: &[u8],
    ) -> Self {
        Self {
            tmst: rx_timestamp_ms,
            time,
            chan,
            rfch,
            freq: freq_mhz,
            stat: 1,
            modu: "LORA".to_string(),
            datr,
            codr,
            rssi: rssi.round() as i32,
            lsnr: round1(snr),
            size: payload.len() as u16,
            data: BASE64.encode(payload),
        }
    }
}

/// Gateway statistics block, emitted inside a PUSH_DATA `stat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub time: String,
    pub lati: f64,
    pub long: f64,
    pub alti: i32,
    pub rxnb: u64,
    pub rxok: u64,
    pub rxfw: u64,
    pub ackr: f64,
    pub dwnb: u64,
    pub txnb: u64,
}

/// A downlink to schedule, as carried in a PULL_RESP `txpk` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    pub imme: bool,
    pub tmst: Option<u64>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub size: u16,
    pub data: String,
}

impl Txpk {
    /// Decode the Base64 `data` field into the raw PHY payload.
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Acknowledgement body sent back for a PULL_RESP, per §4.3 ("TX_ACK
/// carries a JSON `{"txpk_ack":{"error":"…"}}` body").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxpkAckBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushDataRxpk<'a> {
    pub rxpk: &'a [Rxpk],
}

#[derive(Debug, Clone, Serialize)]
pub struct PushDataStat<'a> {
    pub stat: &'a Stat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRespBody {
    pub txpk: Txpk,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxAckBody<'a> {
    pub txpk_ack: &'a TxpkAckBody,
}

/// Round to one decimal place, matching the firmware's `%.1f` formatting
/// for `lsnr` and `ackr` (plain `serde_json` float serialization would
/// otherwise print full `f64` precision).
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rxpk_round_trips_payload_through_base64() {
        let payload = [0x40u8, 0x11, 0x22, 0x33, 0x44, 0x00, 0x01, 0x00];
        let rxpk = Rxpk::new(
            1_000_000,
            "2026-07-31T00:00:00.000000Z".to_string(),
            0,
            0,
            868.1,
            "SF7BW125".to_string(),
            "4/5".to_string(),
            -80.0,
            7.53,
            &payload,
        );
        assert_eq!(rxpk.size, 8);
        assert_eq!(rxpk.lsnr, 7.5);
        let decoded = BASE64.decode(&rxpk.data).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn stat_serializes_ackr_with_one_decimal() {
        let stat = Stat {
            time: "2026-07-31 00:00:00 GMT".to_string(),
            lati: 0.0,
            long: 0.0,
            alti: 0,
            rxnb: 10,
            rxok: 10,
            rxfw: 10,
            ackr: round1(100.0 * 7.0 / 9.0),
            dwnb: 0,
            txnb: 0,
        };
        let json = serde_json::to_string(&stat).unwrap();
        assert!(json.contains("\"ackr\":77.8"));
    }

    #[test]
    fn pull_resp_body_parses_txpk_and_decodes_payload() {
        let raw = r#"{"txpk":{"imme":false,"tmst":1003000,"freq":868.1,"rfch":0,"powe":14,"modu":"LORA","datr":"SF7BW125","codr":"4/5","size":4,"data":"AQIDBA=="}}"#;
        let body: PullRespBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.txpk.freq, 868.1);
        assert_eq!(body.txpk.decode_payload().unwrap(), vec![1, 2, 3, 4]);
    }
}
