//! The `ServerConnector` transport interface.
//!
//! Models the network transport, out of scope for failover purposes
//! (§1 Non-goals: "dynamic connector failover after boot") while still
//! needing a concrete implementation to actually reach a Network Server.
//! `UdpConnector` follows `udp/mod.rs`'s socket handling; `SimConnector`
//! is the loopback double used by integration tests (§6 "Test doubles").

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// A datagram arriving from the Network Server.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    DatagramReceived(Vec<u8>),
    ConnectivityLost,
    ConnectivityRestored,
}

#[async_trait::async_trait]
pub trait ServerConnector: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}

/// UDP connector to a Semtech-protocol Network Server. Binds an ephemeral
/// local port, connects (in the UDP "remember the peer" sense) to the
/// configured server address, and spawns a receive loop forwarding
/// datagrams to `events`.
pub struct UdpConnector {
    socket: Arc<UdpSocket>,
    connected: std::sync::atomic::AtomicBool,
}

impl UdpConnector {
    pub async fn connect(
        server_addr: &str,
        events: mpsc::Sender<ConnectorEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server_addr).await?;
        let socket = Arc::new(socket);

        let connector = Arc::new(Self {
            socket: socket.clone(),
            connected: std::sync::atomic::AtomicBool::new(true),
        });

        tokio::spawn(receive_loop(socket, events));

        Ok(connector)
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, events: mpsc::Sender<ConnectorEvent>) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                let datagram = buf[..len].to_vec();
                if events
                    .send(ConnectorEvent::DatagramReceived(datagram))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "connector receive error");
            }
        }
    }
}

#[async_trait::async_trait]
impl ServerConnector for UdpConnector {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send(datagram).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// In-process loopback connector for tests: `send()` enqueues directly
/// onto a peer's receive channel instead of touching a socket.
pub struct SimConnector {
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    events: mpsc::Sender<ConnectorEvent>,
}

impl SimConnector {
    /// `outbound` carries `(destination, datagram)` pairs to whatever
    /// test harness plays the Network Server; `events` receives
    /// datagrams addressed back to this connector.
    pub fn new(
        peer_addr: SocketAddr,
        outbound: mpsc::Sender<(SocketAddr, Vec<u8>)>,
        events: mpsc::Sender<ConnectorEvent>,
    ) -> Self {
        Self {
            peer_addr,
            outbound,
            events,
        }
    }

    pub async fn deliver(&self, datagram: Vec<u8>) {
        let _ = self
            .events
            .send(ConnectorEvent::DatagramReceived(datagram))
            .await;
    }
}

#[async_trait::async_trait]
impl ServerConnector for SimConnector {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.outbound
            .send((self.peer_addr, datagram.to_vec()))
            .await
            .map_err(|e| anyhow::anyhow!("sim connector outbound channel closed: {e}"))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_connector_roundtrips_a_datagram() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (evt_tx, mut evt_rx) = mpsc::channel(4);
        let addr: SocketAddr = "127.0.0.1:1700".parse().unwrap();
        let connector = SimConnector::new(addr, out_tx, evt_tx);

        connector.send(b"hello").await.unwrap();
        let (dest, payload) = out_rx.recv().await.unwrap();
        assert_eq!(dest, addr);
        assert_eq!(payload, b"hello");

        connector.deliver(b"reply".to_vec()).await;
        match evt_rx.recv().await.unwrap() {
            ConnectorEvent::DatagramReceived(d) => assert_eq!(d, b"reply"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
