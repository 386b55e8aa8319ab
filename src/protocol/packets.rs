use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::wire::codec::{pack_socket_addr, put_header, try_unpack_socket_addr, WireError};
use crate::wire::packet_kind::PacketKind;
use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

/// Hard upper bound for a single presence datagram. Sends that would exceed
///  it fail with [WireError::PayloadTooLarge] - nothing is ever truncated.
pub const MAX_PACKET_SIZE: usize = 1450;

// All deserializers here expect the buffer positioned after the two header
//  bytes - the receive path validates the header once via `check_header` and
//  dispatches on the packet kind.

/// Periodic announcement to the rendezvous server: who we are, where we can
///  be reached, and which peer kinds we want to hear about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckIn {
    pub owner_kind: PeerKind,
    pub id: PeerId,
    pub public_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub interest_kinds: Vec<PeerKind>,
}
impl CheckIn {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        put_header(buf, PacketKind::CheckIn);
        buf.put_u8(self.owner_kind.into());
        self.id.ser(buf);
        pack_socket_addr(buf, self.public_addr)?;
        pack_socket_addr(buf, self.local_addr)?;
        buf.put_u8(self.interest_kinds.len() as u8);
        for kind in &self.interest_kinds {
            buf.put_u8((*kind).into());
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<CheckIn, WireError> {
        let owner_kind = try_get_peer_kind(buf)?;
        let id = PeerId::try_deser(buf)?;
        let public_addr = try_unpack_socket_addr(buf)?;
        let local_addr = try_unpack_socket_addr(buf)?;

        if buf.remaining() < 1 {
            return Err(WireError::BufferTooSmall("interest kind count"));
        }
        let num_interest_kinds = buf.get_u8() as usize;
        if buf.remaining() < num_interest_kinds {
            return Err(WireError::BufferTooSmall("interest kinds"));
        }
        let mut interest_kinds = Vec::with_capacity(num_interest_kinds);
        for _ in 0..num_interest_kinds {
            interest_kinds.push(try_get_peer_kind(buf)?);
        }

        Ok(CheckIn {
            owner_kind,
            id,
            public_addr,
            local_addr,
            interest_kinds,
        })
    }
}

/// One peer in a registry-update packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegistryEntry {
    pub kind: PeerKind,
    pub id: PeerId,
    pub public_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// The rendezvous server's answer to a check-in: the peers matching our
///  interest filter, as tuples repeated until the payload is exhausted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryUpdate {
    pub entries: Vec<RegistryEntry>,
}
impl RegistryUpdate {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        put_header(buf, PacketKind::RegistryUpdate);
        for entry in &self.entries {
            buf.put_u8(entry.kind.into());
            entry.id.ser(buf);
            pack_socket_addr(buf, entry.public_addr)?;
            pack_socket_addr(buf, entry.local_addr)?;
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<RegistryUpdate, WireError> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let kind = try_get_peer_kind(buf)?;
            let id = PeerId::try_deser(buf)?;
            let public_addr = try_unpack_socket_addr(buf)?;
            let local_addr = try_unpack_socket_addr(buf)?;
            entries.push(RegistryEntry {
                kind,
                id,
                public_addr,
                local_addr,
            });
        }
        Ok(RegistryUpdate { entries })
    }
}

/// Which candidate address a ping probes. The reply echoes the scope so the
///  receiver knows which endpoint the exchange just confirmed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PingScope {
    Local = 1,
    Public = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ping {
    pub scope: PingScope,
    pub timestamp_micros: u64,
}
impl Ping {
    pub fn ser(&self, buf: &mut BytesMut) {
        put_header(buf, PacketKind::Ping);
        buf.put_u8(self.scope.into());
        buf.put_u64(self.timestamp_micros);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Ping, WireError> {
        if buf.remaining() < 9 {
            return Err(WireError::BufferTooSmall("ping"));
        }
        let scope = buf.get_u8();
        let scope =
            PingScope::try_from(scope).map_err(|_| WireError::UnknownPacketKind(scope))?;
        let timestamp_micros = buf.get_u64();
        Ok(Ping {
            scope,
            timestamp_micros,
        })
    }
}

/// Echo of a ping plus the replier's own clock, enough for the original
///  sender to compute round-trip time and clock skew.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PingReply {
    pub scope: PingScope,
    pub ping_timestamp_micros: u64,
    pub reply_timestamp_micros: u64,
}
impl PingReply {
    pub fn answering(ping: &Ping, now_micros: u64) -> PingReply {
        PingReply {
            scope: ping.scope,
            ping_timestamp_micros: ping.timestamp_micros,
            reply_timestamp_micros: now_micros,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_header(buf, PacketKind::PingReply);
        buf.put_u8(self.scope.into());
        buf.put_u64(self.ping_timestamp_micros);
        buf.put_u64(self.reply_timestamp_micros);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<PingReply, WireError> {
        if buf.remaining() < 17 {
            return Err(WireError::BufferTooSmall("ping reply"));
        }
        let scope = buf.get_u8();
        let scope =
            PingScope::try_from(scope).map_err(|_| WireError::UnknownPacketKind(scope))?;
        let ping_timestamp_micros = buf.get_u64();
        let reply_timestamp_micros = buf.get_u64();
        Ok(PingReply {
            scope,
            ping_timestamp_micros,
            reply_timestamp_micros,
        })
    }
}

/// Explicit removal of a peer, by identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KillPeer {
    pub id: PeerId,
}
impl KillPeer {
    pub fn ser(&self, buf: &mut BytesMut) {
        put_header(buf, PacketKind::KillPeer);
        self.id.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<KillPeer, WireError> {
        Ok(KillPeer {
            id: PeerId::try_deser(buf)?,
        })
    }
}

/// A single datagram multiplexing payload slices for several peers, each
///  slice keyed by the identity it belongs to and length-prefixed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BulkPayload {
    pub slices: Vec<(PeerId, Bytes)>,
}
impl BulkPayload {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        put_header(buf, PacketKind::BulkPayload);
        for (id, slice) in &self.slices {
            id.ser(buf);
            buf.put_u16(slice.len() as u16);
            buf.put_slice(slice);
        }

        if buf.len() > MAX_PACKET_SIZE {
            return Err(WireError::PayloadTooLarge {
                actual: buf.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<BulkPayload, WireError> {
        let mut slices = Vec::new();
        while buf.has_remaining() {
            let id = PeerId::try_deser(buf)?;
            if buf.remaining() < 2 {
                return Err(WireError::BufferTooSmall("payload slice length"));
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(WireError::BufferTooSmall("payload slice"));
            }
            slices.push((id, buf.copy_to_bytes(len)));
        }
        Ok(BulkPayload { slices })
    }
}

fn try_get_peer_kind(buf: &mut impl Buf) -> Result<PeerKind, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::BufferTooSmall("peer kind"));
    }
    let tag = buf.get_u8();
    PeerKind::try_from(tag).map_err(|_| WireError::UnknownPeerKind(tag))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::test_util::{test_peer_id, test_socket_addr};
    use crate::wire::codec::{check_header, HEADER_LEN};

    use super::*;

    #[test]
    fn test_check_in_byte_layout() {
        let check_in = CheckIn {
            owner_kind: PeerKind::Agent,
            id: PeerId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            public_addr: "203.0.113.9:40103".parse().unwrap(),
            local_addr: "192.168.1.9:40103".parse().unwrap(),
            interest_kinds: vec![PeerKind::AudioMixer],
        };

        let mut buf = BytesMut::new();
        check_in.ser(&mut buf).unwrap();

        // header(2) + owner(1) + id(16) + public(6) + local(6) + count(1) + kinds(1)
        assert_eq!(buf.len(), 33);
        assert_eq!(&buf[0..2], &[b'C', 1]);
        assert_eq!(buf[2], b'I');
        assert_eq!(
            &buf[3..19],
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(&buf[19..25], &[203, 0, 113, 9, 0x9c, 0xa7]);
        assert_eq!(&buf[25..31], &[192, 168, 1, 9, 0x9c, 0xa7]);
        assert_eq!(buf[31], 1);
        assert_eq!(buf[32], b'M');
    }

    #[rstest]
    #[case::no_interest(vec![])]
    #[case::one_interest(vec![PeerKind::AudioMixer])]
    #[case::several_interests(vec![PeerKind::AudioMixer, PeerKind::AvatarMixer, PeerKind::ContentServer])]
    fn test_check_in_round_trip(#[case] interest_kinds: Vec<PeerKind>) {
        let check_in = CheckIn {
            owner_kind: PeerKind::Agent,
            id: test_peer_id(1),
            public_addr: test_socket_addr(1),
            local_addr: test_socket_addr(2),
            interest_kinds,
        };

        let mut buf = BytesMut::new();
        check_in.ser(&mut buf).unwrap();
        assert_eq!(check_header(&buf).unwrap(), PacketKind::CheckIn);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(CheckIn::try_deser(&mut payload).unwrap(), check_in);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_registry_update_parses_tuples_until_exhausted() {
        let update = RegistryUpdate {
            entries: vec![
                RegistryEntry {
                    kind: PeerKind::AudioMixer,
                    id: test_peer_id(1),
                    public_addr: test_socket_addr(1),
                    local_addr: test_socket_addr(2),
                },
                RegistryEntry {
                    kind: PeerKind::Agent,
                    id: test_peer_id(2),
                    public_addr: test_socket_addr(3),
                    local_addr: test_socket_addr(4),
                },
            ],
        };

        let mut buf = BytesMut::new();
        update.ser(&mut buf).unwrap();
        // header + 2 * (1 + 16 + 6 + 6)
        assert_eq!(buf.len(), HEADER_LEN + 2 * 29);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(RegistryUpdate::try_deser(&mut payload).unwrap(), update);
    }

    #[test]
    fn test_registry_update_rejects_truncated_tuple() {
        let update = RegistryUpdate {
            entries: vec![RegistryEntry {
                kind: PeerKind::Agent,
                id: test_peer_id(1),
                public_addr: test_socket_addr(1),
                local_addr: test_socket_addr(2),
            }],
        };
        let mut buf = BytesMut::new();
        update.ser(&mut buf).unwrap();

        let mut truncated = &buf[HEADER_LEN..buf.len() - 1];
        assert!(RegistryUpdate::try_deser(&mut truncated).is_err());
    }

    #[test]
    fn test_ping_reply_echoes_scope_and_timestamp() {
        let ping = Ping {
            scope: PingScope::Local,
            timestamp_micros: 12345,
        };
        let reply = PingReply::answering(&ping, 20000);

        assert_eq!(reply.scope, PingScope::Local);
        assert_eq!(reply.ping_timestamp_micros, 12345);
        assert_eq!(reply.reply_timestamp_micros, 20000);
    }

    #[rstest]
    #[case::local(PingScope::Local)]
    #[case::public(PingScope::Public)]
    fn test_ping_round_trip(#[case] scope: PingScope) {
        let ping = Ping {
            scope,
            timestamp_micros: 987654321,
        };
        let mut buf = BytesMut::new();
        ping.ser(&mut buf);
        assert_eq!(check_header(&buf).unwrap(), PacketKind::Ping);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(Ping::try_deser(&mut payload).unwrap(), ping);
    }

    #[test]
    fn test_ping_reply_round_trip() {
        let reply = PingReply {
            scope: PingScope::Public,
            ping_timestamp_micros: 111,
            reply_timestamp_micros: 222,
        };
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(check_header(&buf).unwrap(), PacketKind::PingReply);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(PingReply::try_deser(&mut payload).unwrap(), reply);
    }

    #[test]
    fn test_kill_peer_round_trip() {
        let kill = KillPeer {
            id: test_peer_id(7),
        };
        let mut buf = BytesMut::new();
        kill.ser(&mut buf);
        assert_eq!(check_header(&buf).unwrap(), PacketKind::KillPeer);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(KillPeer::try_deser(&mut payload).unwrap(), kill);
    }

    #[test]
    fn test_bulk_payload_demux() {
        let bulk = BulkPayload {
            slices: vec![
                (test_peer_id(1), Bytes::from_static(b"first")),
                (test_peer_id(2), Bytes::from_static(b"second slice")),
                (test_peer_id(3), Bytes::new()),
            ],
        };

        let mut buf = BytesMut::new();
        bulk.ser(&mut buf).unwrap();
        assert_eq!(check_header(&buf).unwrap(), PacketKind::BulkPayload);

        let mut payload = &buf[HEADER_LEN..];
        assert_eq!(BulkPayload::try_deser(&mut payload).unwrap(), bulk);
    }

    #[test]
    fn test_bulk_payload_rejects_oversized_packet() {
        let bulk = BulkPayload {
            slices: vec![(test_peer_id(1), Bytes::from(vec![0u8; MAX_PACKET_SIZE]))],
        };

        let mut buf = BytesMut::new();
        assert!(matches!(
            bulk.ser(&mut buf),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_bulk_payload_rejects_truncated_slice() {
        let mut buf = BytesMut::new();
        test_peer_id(1).ser(&mut buf);
        buf.put_u16(100);
        buf.put_slice(b"short");

        let mut payload: &[u8] = &buf;
        assert_eq!(
            BulkPayload::try_deser(&mut payload),
            Err(WireError::BufferTooSmall("payload slice"))
        );
    }
}
