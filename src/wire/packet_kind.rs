use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Single-byte tag in byte 0 of every presence datagram.
///
/// `StunResponse` is special: a STUN binding success response starts with
///  0x01 and carries the STUN server's own framing after that, so it is
///  dispatched on its leading byte and exempt from the version gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    StunResponse = 0x01,
    CheckIn = b'C',
    RegistryUpdate = b'D',
    Ping = b'P',
    PingReply = b'R',
    KillPeer = b'K',
    BulkPayload = b'b',
}

impl PacketKind {
    /// Expected value of the version byte (byte 1) for this packet kind.
    ///  Bumped independently per kind whenever that kind's layout changes.
    pub fn version(self) -> u8 {
        match self {
            // foreign framing, the byte after the tag is not ours
            PacketKind::StunResponse => 0,
            PacketKind::CheckIn => 1,
            PacketKind::RegistryUpdate => 1,
            PacketKind::Ping => 1,
            PacketKind::PingReply => 1,
            PacketKind::KillPeer => 1,
            PacketKind::BulkPayload => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(PacketKind::StunResponse, 0x01)]
    #[case(PacketKind::CheckIn, b'C')]
    #[case(PacketKind::RegistryUpdate, b'D')]
    #[case(PacketKind::Ping, b'P')]
    #[case(PacketKind::PingReply, b'R')]
    #[case(PacketKind::KillPeer, b'K')]
    #[case(PacketKind::BulkPayload, b'b')]
    fn test_wire_tags(#[case] kind: PacketKind, #[case] tag: u8) {
        assert_eq!(u8::from(kind), tag);
        assert_eq!(PacketKind::try_from(tag).unwrap(), kind);
    }
}
