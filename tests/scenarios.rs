//! End-to-end scenarios exercising the gateway stack through its public
//! API: Node Manager, Realtime Sender, Protocol Engine and Server Manager
//! wired together the same way `run_gateway` wires them, against
//! `SimTransceiver`/`SimConnector` test doubles (§8 S1-S6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::time::Duration;

use lorawan_gateway::config::Config;
use lorawan_gateway::connector::{ConnectorEvent, ServerConnector, SimConnector};
use lorawan_gateway::node_manager::{self, NodeManagerEvent, NodeManagerHandle};
use lorawan_gateway::protocol::{
    HeartbeatPeriods, Identifier, ProtocolEngine, SessionEvent, UplinkRequest, PROTOCOL_VERSION,
};
use lorawan_gateway::protocol::json::Rxpk;
use lorawan_gateway::server_manager::{self, ServerManagerHandle};
use lorawan_gateway::transceiver::{now_ms, LoraTransceiver, RxMetadata, SimTransceiver, TransceiverHandle};

struct Harness {
    sim: Arc<SimTransceiver>,
    out_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    evt_tx: mpsc::Sender<ConnectorEvent>,
    node: NodeManagerHandle,
    _server: ServerManagerHandle,
}

async fn spawn_harness(config: Config) -> Harness {
    let (radio_tx, radio_rx) = mpsc::channel(64);
    let handle0 = TransceiverHandle(0);
    let sim = Arc::new(SimTransceiver::new(handle0, radio_tx));
    let mut transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>> = HashMap::new();
    transceivers.insert(handle0, sim.clone());

    let (node, uplink_forwards, downlink_outcomes) =
        node_manager::spawn(config.clone(), transceivers, radio_rx);

    let (out_tx, out_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(64);
    let (evt_tx, evt_rx) = mpsc::channel::<ConnectorEvent>(64);
    let peer_addr: SocketAddr = "127.0.0.1:1700".parse().unwrap();
    let connector: Arc<dyn ServerConnector> =
        Arc::new(SimConnector::new(peer_addr, out_tx, evt_tx.clone()));

    let periods = HeartbeatPeriods {
        pushstat_period_ms: config.heartbeat.pushstat_period_ms,
        pulldata_period_ms: config.heartbeat.pulldata_period_ms,
    };
    let server = server_manager::spawn(
        config.gateway.gateway_eui(),
        config.capacity.transaction_id_bits,
        periods,
        node.clone(),
        uplink_forwards,
        downlink_outcomes,
        connector,
        evt_rx,
    );

    Harness {
        sim,
        out_rx,
        evt_tx,
        node,
        _server: server,
    }
}

fn metadata() -> RxMetadata {
    RxMetadata {
        freq_mhz: 868.1,
        datr: "SF7BW125".to_string(),
        codr: "4/5".to_string(),
        snr: 7.0,
        rssi: -90.0,
    }
}

/// Skip past heartbeat `stat`/PULL_DATA traffic and return the next
/// PUSH_DATA carrying an `rxpk` body.
async fn recv_rxpk_push_data(out_rx: &mut mpsc::Receiver<(SocketAddr, Vec<u8>)>) -> Vec<u8> {
    loop {
        let (_, datagram) = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .expect("timed out waiting for push_data")
            .expect("connector channel closed");
        if datagram.len() > 12
            && datagram[3] == Identifier::PushData as u8
            && String::from_utf8_lossy(&datagram[12..]).contains("\"rxpk\"")
        {
            return datagram;
        }
    }
}

async fn recv_tx_ack(out_rx: &mut mpsc::Receiver<(SocketAddr, Vec<u8>)>) -> Vec<u8> {
    loop {
        match tokio::time::timeout(Duration::from_millis(50), out_rx.recv()).await {
            Ok(Some((_, datagram))) if datagram.get(3) == Some(&(Identifier::TxAck as u8)) => {
                return datagram;
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn s1_unconfirmed_uplink_round_trips_push_data_and_push_ack() {
    let config = Config::default();
    let gateway_eui = config.gateway.gateway_eui();
    let mut h = spawn_harness(config).await;

    let rx_timestamp_ms = 1_000_000;
    let mut payload = vec![0x40, 0x44, 0x33, 0x22, 0x11, 0x00, 0x01, 0x00];
    payload.extend(std::iter::repeat(0xAAu8).take(12));
    assert_eq!(payload.len(), 20);
    h.sim.inject_received(payload.clone(), rx_timestamp_ms, metadata()).await;

    let push_data = recv_rxpk_push_data(&mut h.out_rx).await;
    assert_eq!(push_data[0], PROTOCOL_VERSION);
    assert_eq!(push_data[3], Identifier::PushData as u8);
    assert_eq!(&push_data[4..12], &gateway_eui);

    let body: serde_json::Value = serde_json::from_slice(&push_data[12..]).unwrap();
    let rxpk = &body["rxpk"][0];
    assert_eq!(rxpk["freq"].as_f64().unwrap(), 868.1);
    assert_eq!(rxpk["size"].as_u64().unwrap(), 20);
    let decoded = BASE64.decode(rxpk["data"].as_str().unwrap()).unwrap();
    assert_eq!(decoded, payload);

    let ack = vec![PROTOCOL_VERSION, push_data[1], push_data[2], Identifier::PushAck as u8];
    h.evt_tx.send(ConnectorEvent::DatagramReceived(ack)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sim.sent_packets().is_empty(), "unconfirmed uplink must not synthesize a downlink");
}

#[tokio::test]
async fn s2_confirmed_uplink_produces_synthesized_ack_after_push_ack() {
    let mut h = spawn_harness(Config::default()).await;

    let rx_timestamp_ms = now_ms();
    let payload = vec![0x80, 0x44, 0x33, 0x22, 0x11, 0x00, 0x01, 0x00];
    h.sim.inject_received(payload, rx_timestamp_ms, metadata()).await;

    let push_data = recv_rxpk_push_data(&mut h.out_rx).await;
    let ack = vec![PROTOCOL_VERSION, push_data[1], push_data[2], Identifier::PushAck as u8];
    h.evt_tx.send(ConnectorEvent::DatagramReceived(ack)).await.unwrap();

    let mut sent = Vec::new();
    for _ in 0..50 {
        sent = h.sim.sent_packets();
        if !sent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sent.len(), 1, "confirmed uplink must synthesize exactly one ACK downlink");
    assert_eq!(
        sent[0].payload,
        vec![0x80, 0x44, 0x33, 0x22, 0x11, 0x10, 0x01, 0x00, 0x00, 0x00]
    );
}

#[tokio::test]
async fn s3_late_pull_resp_reports_too_late_via_tx_ack() {
    let mut h = spawn_harness(Config::default()).await;

    let uplink = vec![0x40, 0x44, 0x33, 0x22, 0x11, 0x00, 0x01, 0x00];
    h.sim.inject_received(uplink, now_ms(), metadata()).await;
    recv_rxpk_push_data(&mut h.out_rx).await;

    // Let the node's Class-A receive windows fully expire before the
    // Network Server's PULL_RESP arrives.
    tokio::time::sleep(Duration::from_millis(3_200)).await;

    let mut pull_resp = vec![PROTOCOL_VERSION, 0x56, 0x78, Identifier::PullResp as u8];
    pull_resp.extend_from_slice(
        br#"{"txpk":{"imme":false,"tmst":null,"freq":869.525,"rfch":0,"powe":14,"modu":"LORA","datr":"SF12BW125","codr":"4/5","size":8,"data":"QEQzIhEAAQA="}}"#,
    );
    h.evt_tx.send(ConnectorEvent::DatagramReceived(pull_resp)).await.unwrap();

    let tx_ack = tokio::time::timeout(Duration::from_secs(2), recv_tx_ack(&mut h.out_rx))
        .await
        .expect("no TX_ACK observed for the late downlink");
    let body = String::from_utf8(tx_ack[12..].to_vec()).unwrap();
    assert!(body.contains("\"error\":\"TOO_LATE\""), "unexpected TX_ACK body: {body}");
    assert!(h.sim.sent_packets().is_empty());
}

#[tokio::test]
async fn s4_heartbeat_cadence_interleaves_stat_and_pulldata() {
    let mut config = Config::default();
    config.heartbeat.pushstat_period_ms = 1_500;
    config.heartbeat.pulldata_period_ms = 2_500;
    let mut h = spawn_harness(config).await;

    tokio::time::sleep(Duration::from_millis(12_500)).await;

    let mut stat_count = 0;
    let mut pulldata_count = 0;
    loop {
        let datagram = match h.out_rx.try_recv() {
            Ok((_, datagram)) => datagram,
            Err(_) => break,
        };
        match datagram.get(3) {
            Some(id) if *id == Identifier::PushData as u8 => {
                if String::from_utf8_lossy(&datagram[12..]).contains("\"stat\"") {
                    stat_count += 1;
                }
            }
            Some(id) if *id == Identifier::PullData as u8 => pulldata_count += 1,
            _ => {}
        }
    }

    assert!(stat_count >= 4, "expected at least 4 stat PUSH_DATA messages, saw {stat_count}");
    assert!(pulldata_count >= 3, "expected at least 3 PULL_DATA messages, saw {pulldata_count}");
}

#[tokio::test]
async fn s5_pool_exhaustion_drops_excess_uplinks_without_entering_error_state() {
    let mut config = Config::default();
    config.capacity.transceiver_count = 1; // max_up_sessions() == 3
    assert_eq!(config.capacity.max_up_sessions(), 3);

    let (radio_tx, radio_rx) = mpsc::channel(32);
    let handle0 = TransceiverHandle(0);
    let sim = Arc::new(SimTransceiver::new(handle0, radio_tx));
    let mut transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>> = HashMap::new();
    transceivers.insert(handle0, sim.clone());

    let (node, mut forwards, _outcomes) = node_manager::spawn(config, transceivers, radio_rx);

    // Accept every forwarded uplink immediately but never acknowledge it,
    // so its session slot stays held, mirroring a Network Server that is
    // slow to ack while more uplinks keep arriving.
    let accept = node.clone();
    tokio::spawn(async move {
        while let Some(forward) = forwards.recv().await {
            accept.session_event(NodeManagerEvent::UplinkAccepted { session_id: forward.session_id });
        }
    });

    for i in 0..8u32 {
        let dev_addr = 0x1000_0000 + i;
        let mut payload = vec![0x40];
        payload.extend_from_slice(&dev_addr.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(&(i as u16).to_le_bytes());
        sim.inject_received(payload, now_ms(), metadata()).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node.missed_uplinks(), 5, "expected exactly MAX_UP_SESSIONS+5-3 drops");
}

#[test]
fn s6_protocol_token_never_collides_with_a_live_transaction_after_wrap() {
    const EUI: [u8; 8] = [0x02, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x01];
    let periods = HeartbeatPeriods {
        pushstat_period_ms: 60_000,
        pulldata_period_ms: 100_000,
    };
    let engine = ProtocolEngine::new(EUI, 3, periods);

    let sample_rxpk = || {
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
    };

    let (first_msg, _) = engine
        .build_uplink(UplinkRequest::LoraData { rxpk: sample_rxpk() }, 0, 0)
        .unwrap()
        .unwrap();
    let live_token = first_msg.token();

    // Capacity is 2^3 = 8 slots; the message-id counter wraps after
    // 0xFFFF >> 3 = 8191 values. Drive the counter all the way around
    // while the first transaction stays alive and confirm nothing
    // issued after the wrap reuses its token.
    let wrap_count = (0xFFFFu32 >> 3) + 2;
    for i in 1..wrap_count {
        let (msg, protocol_msg_id) = engine
            .build_uplink(UplinkRequest::LoraData { rxpk: sample_rxpk() }, i, 0)
            .unwrap()
            .unwrap();
        assert_ne!(msg.token(), live_token, "token collided with the still-live transaction");
        engine.process_session_event(protocol_msg_id, SessionEvent::Released);
    }
}
