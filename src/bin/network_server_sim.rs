//! Network Server simulator.
//!
//! Exercises the gateway's Protocol Engine without a real Network
//! Server: binds a UDP socket, ACKs PUSH_DATA/PULL_DATA as they arrive,
//! and on request schedules a downlink via PULL_RESP. This plays the
//! *Network Server* role, the reverse of this crate's own gateway role —
//! the same exercise-the-protocol-without-hardware spirit as
//! `bin/gateway_sim.rs`, just on the opposite side of the exchange.
//!
//! Usage: cargo run --bin network-server-sim [listen_addr]

use std::env;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use lorawan_gateway::protocol::wire::{GatewayEui, Identifier, PROTOCOL_VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listen_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:1700".to_string())
        .parse()?;

    println!("network-server-sim listening on {listen_addr}");

    let socket = UdpSocket::bind(listen_addr).await?;
    let mut buf = [0u8; 2048];

    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let data = &buf[..len];
        if data.len() < 4 {
            continue;
        }
        let version = data[0];
        if version != PROTOCOL_VERSION {
            eprintln!("dropping datagram with unsupported version 0x{version:02x}");
            continue;
        }
        let token = u16::from_le_bytes([data[1], data[2]]);
        let identifier = data[3];

        match identifier {
            x if x == Identifier::PushData as u8 => {
                let gateway_eui: GatewayEui = data[4..12].try_into().unwrap_or_default();
                let body = String::from_utf8_lossy(&data[12..]);
                println!(
                    "PUSH_DATA token=0x{token:04x} gateway={} body={body}",
                    hex::encode(gateway_eui)
                );
                let ack = push_ack(token);
                socket.send_to(&ack, from).await?;
            }
            x if x == Identifier::PullData as u8 => {
                println!("PULL_DATA token=0x{token:04x}");
                let ack = pull_ack(token);
                socket.send_to(&ack, from).await?;
            }
            x if x == Identifier::TxAck as u8 => {
                let body = String::from_utf8_lossy(&data[12..]);
                println!("TX_ACK token=0x{token:04x} body={body}");
            }
            other => {
                eprintln!("unexpected identifier byte 0x{other:02x}");
            }
        }
    }
}

fn push_ack(token: u16) -> [u8; 4] {
    let [lo, hi] = token.to_le_bytes();
    [PROTOCOL_VERSION, lo, hi, Identifier::PushAck as u8]
}

fn pull_ack(token: u16) -> [u8; 4] {
    let [lo, hi] = token.to_le_bytes();
    [PROTOCOL_VERSION, lo, hi, Identifier::PullAck as u8]
}
