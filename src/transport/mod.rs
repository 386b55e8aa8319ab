use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Datagram counters since process start (or the last reset), consumed by
///  stats reporting in higher layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub struct PacketStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

/// A thin UDP socket for the presence protocol: bind at construction,
///  fire-and-forget sends, receive with a short timeout so the owning loop
///  can interleave other work.
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
    receive_timeout: Duration,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}
impl UdpTransport {
    /// Binding is the only fatal failure in this layer: without a socket
    ///  there is no presence protocol, so this surfaces at construction.
    pub async fn bind(port: u16) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_port = socket.local_addr()?.port();
        debug!("bound presence socket on port {}", local_port);

        Ok(UdpTransport {
            socket,
            local_port,
            receive_timeout: Duration::from_millis(250),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Fire-and-forget: the protocol is designed to tolerate packet loss, so
    ///  a failed send is logged and swallowed rather than propagated.
    pub async fn send_to(&self, addr: SocketAddr, buf: &[u8]) {
        match self.socket.send_to(buf, addr).await {
            Ok(num_sent) => {
                self.packets_sent.fetch_add(1, Ordering::AcqRel);
                self.bytes_sent.fetch_add(num_sent as u64, Ordering::AcqRel);
            }
            Err(e) => {
                warn!("error sending {} bytes to {}: {}", buf.len(), addr, e);
            }
        }
    }

    /// One datagram with its sender, or None when the receive timeout
    ///  elapsed without traffic.
    pub async fn recv(&self) -> Option<(SocketAddr, BytesMut)> {
        let mut buf = BytesMut::zeroed(RECEIVE_BUFFER_SIZE);

        match timeout(self.receive_timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((num_read, sender))) => {
                buf.truncate(num_read);
                self.packets_received.fetch_add(1, Ordering::AcqRel);
                self.bytes_received
                    .fetch_add(num_read as u64, Ordering::AcqRel);
                Some((sender, buf))
            }
            Ok(Err(e)) => {
                warn!("error receiving datagram: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    pub async fn resolve_hostname(name: &str, port: u16) -> anyhow::Result<SocketAddr> {
        lookup_host((name, port))
            .await?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| anyhow!("no IPv4 address found for {}", name))
    }

    pub fn packet_stats(&self) -> PacketStats {
        PacketStats {
            packets_sent: self.packets_sent.load(Ordering::Acquire),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            packets_received: self.packets_received.load(Ordering::Acquire),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
        }
    }

    pub fn reset_packet_stats(&self) {
        self.packets_sent.store(0, Ordering::Release);
        self.bytes_sent.store(0, Ordering::Release);
        self.packets_received.store(0, Ordering::Release);
        self.bytes_received.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let a = UdpTransport::bind(0).await.unwrap();
        let b = UdpTransport::bind(0).await.unwrap();

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        a.send_to(b_addr, b"hello").await;

        let (sender, received) = b.recv().await.unwrap();
        assert_eq!(received.as_ref(), b"hello");
        assert_eq!(sender.port(), a.local_port());

        assert_eq!(
            a.packet_stats(),
            PacketStats {
                packets_sent: 1,
                bytes_sent: 5,
                packets_received: 0,
                bytes_received: 0,
            }
        );
        assert_eq!(
            b.packet_stats(),
            PacketStats {
                packets_sent: 0,
                bytes_sent: 0,
                packets_received: 1,
                bytes_received: 5,
            }
        );

        b.reset_packet_stats();
        assert_eq!(b.packet_stats(), PacketStats::default());
    }

    #[tokio::test]
    async fn test_recv_times_out_without_traffic() {
        let transport = UdpTransport::bind(0).await.unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_a_construction_error() {
        let first = UdpTransport::bind(0).await.unwrap();
        assert!(UdpTransport::bind(first.local_port()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let transport = UdpTransport::bind(0).await.unwrap();
        // port 0 as a destination is invalid and fails the send
        transport
            .send_to("127.0.0.1:0".parse().unwrap(), b"dropped")
            .await;
    }

    #[tokio::test]
    async fn test_resolve_hostname() {
        let addr = UdpTransport::resolve_hostname("localhost", 4711)
            .await
            .unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 4711);
    }
}
