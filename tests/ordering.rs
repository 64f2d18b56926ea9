//! Concurrency smoke test for the session-state serialization invariant:
//! only the session-manager task mutates an `UplinkSession`/
//! `DownlinkSession` record, every other task reaches it by enqueueing a
//! `NodeManagerEvent` naming a `PoolId` (§3 Invariants, §4.1's single
//! `command_rx` loop).
//!
//! Drives many sessions' `progressing-uplink -> uplink-sent` transitions
//! from independent tasks racing against each other on the same
//! `NodeManagerHandle`. If command handling were not serialized one at a
//! time, two sessions' records could tear or swap under the race and a
//! synthesized ACK would end up carrying the wrong DevAddr/FCnt, or be
//! duplicated, or go missing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;

use lorawan_gateway::config::Config;
use lorawan_gateway::node_manager::{self, NodeManagerEvent};
use lorawan_gateway::transceiver::{
    now_ms, LoraTransceiver, RxMetadata, SimTransceiver, TransceiverHandle,
};

fn metadata() -> RxMetadata {
    RxMetadata {
        freq_mhz: 868.1,
        datr: "SF7BW125".to_string(),
        codr: "4/5".to_string(),
        snr: 7.0,
        rssi: -90.0,
    }
}

fn confirmed_uplink(dev_addr: u32, fcnt: u16) -> Vec<u8> {
    let mut payload = vec![0x80u8];
    payload.extend_from_slice(&dev_addr.to_le_bytes());
    payload.push(0x00);
    payload.extend_from_slice(&fcnt.to_le_bytes());
    payload
}

fn expected_ack(dev_addr: u32, fcnt: u16) -> Vec<u8> {
    let mut frame = vec![0x80u8];
    frame.extend_from_slice(&dev_addr.to_le_bytes());
    frame.push(0x10);
    frame.extend_from_slice(&(fcnt as u32).to_le_bytes());
    frame
}

#[tokio::test]
async fn concurrent_session_events_never_cross_contaminate_sessions() {
    const N: u32 = 12;

    let mut config = Config::default();
    config.capacity.transceiver_count = 5; // max_up_sessions() == 15, headroom over N
    assert!(config.capacity.max_up_sessions() as u32 > N);

    let (radio_tx, radio_rx) = mpsc::channel(64);
    let handle0 = TransceiverHandle(0);
    let sim = Arc::new(SimTransceiver::new(handle0, radio_tx));
    let mut transceivers: HashMap<TransceiverHandle, Arc<dyn LoraTransceiver>> = HashMap::new();
    transceivers.insert(handle0, sim.clone());

    let (node, mut forwards, _outcomes) = node_manager::spawn(config, transceivers, radio_rx);

    // Admit every uplink sequentially and deterministically, one at a
    // time, exactly like a Network Server that accepts forwards as fast
    // as they arrive. The race this test cares about starts afterward.
    let mut sessions = Vec::new();
    for i in 0..N {
        let dev_addr = 0x2000_0000 + i;
        sim.inject_received(confirmed_uplink(dev_addr, i as u16), now_ms(), metadata())
            .await;
        let forward = forwards.recv().await.expect("forward channel closed early");
        node.session_event(NodeManagerEvent::UplinkAccepted {
            session_id: forward.session_id,
        });
        sessions.push((forward.session_id, forward.dev_addr, forward.fcnt));
    }
    assert_eq!(sessions.len(), N as usize);

    // Now race every session's `progressing-uplink -> uplink-sent`
    // transition against every other session's, all posted from
    // independent tasks at once through the same handle.
    let mut racers = Vec::new();
    for (session_id, dev_addr, fcnt) in sessions {
        let node = node.clone();
        racers.push(tokio::spawn(async move {
            node.session_event(NodeManagerEvent::UplinkProgressing { session_id });
            node.session_event(NodeManagerEvent::UplinkSent {
                session_id,
                confirmed: true,
            });
            (dev_addr, fcnt)
        }));
    }
    let mut pairs = Vec::new();
    for racer in racers {
        pairs.push(racer.await.unwrap());
    }

    let mut sent = Vec::new();
    for _ in 0..100 {
        sent = sim.sent_packets();
        if sent.len() >= N as usize {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        sent.len(),
        N as usize,
        "every session must independently reach uplink-sent and synthesize exactly one ACK"
    );

    let mut by_payload: HashMap<Vec<u8>, u32> = HashMap::new();
    for packet in &sent {
        *by_payload.entry(packet.payload.clone()).or_insert(0) += 1;
    }
    for (dev_addr, fcnt) in &pairs {
        let expected = expected_ack(*dev_addr, *fcnt);
        let count = by_payload.get(&expected).copied().unwrap_or(0);
        assert_eq!(
            count, 1,
            "dev_addr {dev_addr:#x}/fcnt {fcnt} produced {count} ACKs instead of exactly one \
             (a state tear or swap between concurrently-handled sessions)"
        );
    }
}
