//! Gateway configuration.
//!
//! Loaded from TOML via a `Config::load`/`Config::default` pair; covers
//! every option named in §6 (transceiver radio parameters, network-server
//! connection, heartbeat periods, pool capacities) plus the geolocation
//! and gateway-id fields that `original_source/` hard-codes and are
//! treated here as configuration (§9 open questions).

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub transceivers: Vec<TransceiverConfig>,
    pub network_server: NetworkServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub capacity: CapacityConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            transceivers: vec![TransceiverConfig::default()],
            network_server: NetworkServerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            capacity: CapacityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;
        Ok(config)
    }
}

/// Gateway identity and fixed location, reported in the `stat` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// MAC address the 8-byte Semtech gateway EUI is derived from.
    pub mac_address: [u8; 6],
    /// 2-byte infix inserted between the MAC's OUI and NIC halves,
    /// chosen per the registered Network Server (the original hard-codes
    /// this per build; here it is configuration).
    pub eui_infix: [u8; 2],
    pub location: GatewayLocation,
    /// Whether the Node Manager synthesizes an ACK downlink for
    /// *unconfirmed* uplinks too, not just confirmed ones (§9 open
    /// question; default `false` matches LoRaWAN Class-A semantics).
    pub ack_unconfirmed_uplinks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mac_address: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            eui_infix: [0xFF, 0xFF],
            location: GatewayLocation::default(),
            ack_unconfirmed_uplinks: false,
        }
    }
}

impl GatewayConfig {
    /// The 8-byte Semtech gateway id: MAC[0..3] | infix | MAC[3..6].
    pub fn gateway_eui(&self) -> [u8; 8] {
        let m = self.mac_address;
        let i = self.eui_infix;
        [m[0], m[1], m[2], i[0], i[1], m[3], m[4], m[5]]
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct GatewayLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

/// LoRa radio configuration for one bound transceiver. Fields default
/// when not supplied, per §4.1 `initialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransceiverConfig {
    pub preamble_length: u16,
    pub sync_word: u8,
    pub explicit_header: bool,
    pub crc_on: bool,
    pub mode: LoraMode,
    pub power: PowerMode,
    pub channel: FrequencyChannel,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            preamble_length: 8,
            sync_word: 0x34, // public LoRaWAN network
            explicit_header: true,
            crc_on: true,
            mode: LoraMode::default(),
            power: PowerMode::default(),
            channel: FrequencyChannel::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraMode {
    /// Named preset (e.g. a duty-cycle-friendly default).
    Preset(String),
    /// Explicit radio parameters.
    Explicit {
        bandwidth_hz: u32,
        coding_rate: String,
        spreading_factor: u8,
    },
}

impl Default for LoraMode {
    fn default() -> Self {
        LoraMode::Explicit {
            bandwidth_hz: 125_000,
            coding_rate: "4/5".to_string(),
            spreading_factor: 7,
        }
    }
}

impl LoraMode {
    /// Datarate identifier as written into `rxpk.datr` (e.g. `SF7BW125`).
    pub fn datr(&self) -> String {
        match self {
            LoraMode::Preset(name) => name.clone(),
            LoraMode::Explicit {
                bandwidth_hz,
                spreading_factor,
                ..
            } => format!("SF{}BW{}", spreading_factor, bandwidth_hz / 1000),
        }
    }

    pub fn codr(&self) -> String {
        match self {
            LoraMode::Preset(_) => "4/5".to_string(),
            LoraMode::Explicit { coding_rate, .. } => coding_rate.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Preset(String),
    Explicit { power_level_dbm: i8, ocp_ma: u16 },
}

impl Default for PowerMode {
    fn default() -> Self {
        PowerMode::Explicit {
            power_level_dbm: 14,
            ocp_ma: 100,
        }
    }
}

/// EU868 channel plan plus RX2, named per §6.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyChannel {
    Eu868Ch0,
    Eu868Ch1,
    Eu868Ch2,
    Eu868Ch3,
    Eu868Ch4,
    Eu868Ch5,
    Eu868ChRx2,
}

impl Default for FrequencyChannel {
    fn default() -> Self {
        FrequencyChannel::Eu868Ch0
    }
}

impl FrequencyChannel {
    /// Center frequency in MHz, as written into `rxpk.freq`/`txpk.freq`.
    pub fn freq_mhz(self) -> f64 {
        match self {
            FrequencyChannel::Eu868Ch0 => 868.1,
            FrequencyChannel::Eu868Ch1 => 868.3,
            FrequencyChannel::Eu868Ch2 => 868.5,
            FrequencyChannel::Eu868Ch3 => 867.1,
            FrequencyChannel::Eu868Ch4 => 867.3,
            FrequencyChannel::Eu868Ch5 => 867.5,
            FrequencyChannel::Eu868ChRx2 => 869.525,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkServerConfig {
    pub url: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub sntp_url: String,
    pub sntp_period_secs: u64,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1".to_string(),
            port: 1700,
            user: String::new(),
            password: String::new(),
            sntp_url: "pool.ntp.org".to_string(),
            sntp_period_secs: 3600,
        }
    }
}

impl NetworkServerConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.url, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub pushstat_period_ms: u64,
    pub pulldata_period_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pushstat_period_ms: 60_000,
            pulldata_period_ms: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub max_nodes: usize,
    pub transceiver_count: usize,
    /// `N`: the transaction pool holds `2^N` slots and every outstanding
    /// message-id's low `N` bits are its pool index. Default 3 (8 slots,
    /// matching the default `max_up_sessions() + max_down_sessions()`).
    pub transaction_id_bits: u8,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_nodes: 64,
            transceiver_count: 1,
            transaction_id_bits: 3,
        }
    }
}

impl CapacityConfig {
    pub fn max_up_sessions(&self) -> usize {
        3 * self.transceiver_count
    }

    pub fn max_down_sessions(&self) -> usize {
        5 * self.transceiver_count
    }

    pub fn max_protocol_transactions(&self) -> usize {
        1usize << self.transaction_id_bits
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_transceiver_and_sane_capacities() {
        let config = Config::default();
        assert_eq!(config.transceivers.len(), 1);
        assert_eq!(config.capacity.max_up_sessions(), 3);
        assert_eq!(config.capacity.max_down_sessions(), 5);
        assert_eq!(config.capacity.max_protocol_transactions(), 8);
    }

    #[test]
    fn gateway_eui_interleaves_infix_between_mac_halves() {
        let gw = GatewayConfig {
            mac_address: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            eui_infix: [0xAA, 0xBB],
            location: GatewayLocation::default(),
            ack_unconfirmed_uplinks: false,
        };
        assert_eq!(
            gw.gateway_eui(),
            [0x01, 0x02, 0x03, 0xAA, 0xBB, 0x04, 0x05, 0x06]
        );
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_str = r#"
            [network_server]
            url = "lns.example.org"
            port = 1700
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.network_server.url, "lns.example.org");
        assert_eq!(config.network_server.port, 1700);
        // unspecified sections fall back to their defaults
        assert_eq!(config.heartbeat.pushstat_period_ms, 60_000);
    }
}
