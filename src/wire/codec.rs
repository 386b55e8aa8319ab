use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::wire::packet_kind::PacketKind;

/// 1 byte packet-kind tag + 1 byte version. Fixed at 2 for wire
///  compatibility - a constant, not a computed value.
pub const HEADER_LEN: usize = 2;

/// IPv4 address (network byte order) + port.
pub const SOCKET_ADDR_LEN: usize = 6;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WireError {
    #[error("buffer too small decoding {0}")]
    BufferTooSmall(&'static str),
    #[error("unknown packet kind tag {0:#04x}")]
    UnknownPacketKind(u8),
    #[error("unknown peer kind tag {0:#04x}")]
    UnknownPeerKind(u8),
    #[error("only IPv4 addresses exist on the wire, got {0}")]
    UnsupportedAddressFamily(SocketAddr),
    #[error("version mismatch on {kind:?}: got {actual}, expected {expected}")]
    VersionMismatch {
        kind: PacketKind,
        actual: u8,
        expected: u8,
    },
    #[error("payload of {actual} bytes exceeds the maximum packet size of {max}")]
    PayloadTooLarge { actual: usize, max: usize },
}

pub fn put_header(buf: &mut impl BufMut, kind: PacketKind) {
    buf.put_u8(kind.into());
    buf.put_u8(kind.version());
}

/// Checks the two header bytes of an inbound datagram. A packet is accepted
///  only if its version byte matches the expected version for its kind;
///  STUN responses are exempt because the bytes after the leading tag are
///  the STUN server's own framing.
pub fn check_header(packet: &[u8]) -> Result<PacketKind, WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::BufferTooSmall("packet header"));
    }

    let kind =
        PacketKind::try_from(packet[0]).map_err(|_| WireError::UnknownPacketKind(packet[0]))?;

    if kind != PacketKind::StunResponse && packet[1] != kind.version() {
        return Err(WireError::VersionMismatch {
            kind,
            actual: packet[1],
            expected: kind.version(),
        });
    }

    Ok(kind)
}

/// Packs an IPv4 socket address as 4 address bytes (network byte order)
///  followed by the 2 port bytes, returning the number of bytes written.
pub fn pack_socket_addr(buf: &mut impl BufMut, addr: SocketAddr) -> Result<usize, WireError> {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u32(v4.ip().to_bits());
            buf.put_u16(v4.port());
            Ok(SOCKET_ADDR_LEN)
        }
        SocketAddr::V6(_) => Err(WireError::UnsupportedAddressFamily(addr)),
    }
}

pub fn try_unpack_socket_addr(buf: &mut impl Buf) -> Result<SocketAddr, WireError> {
    if buf.remaining() < SOCKET_ADDR_LEN {
        return Err(WireError::BufferTooSmall("socket address"));
    }
    let ip = Ipv4Addr::from_bits(buf.get_u32());
    let port = buf.get_u16();
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1.2.3.4:5", vec![1, 2, 3, 4, 0, 5])]
    #[case("203.0.113.9:40103", vec![203, 0, 113, 9, 0x9c, 0xa7])]
    #[case("255.255.255.255:65535", vec![255, 255, 255, 255, 255, 255])]
    #[case("0.0.0.0:0", vec![0, 0, 0, 0, 0, 0])]
    fn test_socket_addr_layout(#[case] addr: SocketAddr, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        let written = pack_socket_addr(&mut buf, addr).unwrap();

        assert_eq!(written, SOCKET_ADDR_LEN);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(try_unpack_socket_addr(&mut b).unwrap(), addr);
        assert!(b.is_empty());
    }

    #[test]
    fn test_socket_addr_rejects_ipv6() {
        let addr: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(
            pack_socket_addr(&mut buf, addr),
            Err(WireError::UnsupportedAddressFamily(addr))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unpack_socket_addr_short_buffer() {
        let mut b: &[u8] = &[1, 2, 3, 4, 5];
        assert_eq!(
            try_unpack_socket_addr(&mut b),
            Err(WireError::BufferTooSmall("socket address"))
        );
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, PacketKind::Ping);

        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(buf[0], b'P');
        assert_eq!(buf[1], PacketKind::Ping.version());
    }

    #[rstest]
    #[case(PacketKind::RegistryUpdate)]
    #[case(PacketKind::Ping)]
    #[case(PacketKind::PingReply)]
    #[case(PacketKind::KillPeer)]
    #[case(PacketKind::BulkPayload)]
    fn test_version_gate_accepts_matching(#[case] kind: PacketKind) {
        let packet = [kind.into(), kind.version(), 0xff];
        assert_eq!(check_header(&packet).unwrap(), kind);
    }

    #[rstest]
    #[case(PacketKind::RegistryUpdate)]
    #[case(PacketKind::Ping)]
    fn test_version_gate_rejects_mismatch(#[case] kind: PacketKind) {
        let packet = [kind.into(), kind.version() + 1];
        assert_eq!(
            check_header(&packet),
            Err(WireError::VersionMismatch {
                kind,
                actual: kind.version() + 1,
                expected: kind.version(),
            })
        );
    }

    #[test]
    fn test_version_gate_exempts_stun_response() {
        // byte 1 of a STUN response is part of the STUN message type
        for second_byte in [0x00, 0x01, 0x42, 0xff] {
            let packet = [0x01, second_byte];
            assert_eq!(check_header(&packet).unwrap(), PacketKind::StunResponse);
        }
    }

    #[test]
    fn test_check_header_unknown_tag() {
        assert_eq!(
            check_header(&[0x7f, 1]),
            Err(WireError::UnknownPacketKind(0x7f))
        );
    }

    #[test]
    fn test_check_header_short_buffer() {
        assert_eq!(
            check_header(&[b'P']),
            Err(WireError::BufferTooSmall("packet header"))
        );
    }
}
