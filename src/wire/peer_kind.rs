use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Single-byte tag identifying what role a peer plays in the presence
///  protocol. The tag values are ASCII characters on the wire, kept stable
///  for compatibility with deployed rendezvous servers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PeerKind {
    Domain = b'D',
    ContentServer = b'V',
    Agent = b'I',
    AudioMixer = b'M',
    AvatarMixer = b'W',
    AudioInjector = b'A',
}

impl PeerKind {
    /// Solo kinds have at most one alive instance at a time and are looked up
    ///  directly rather than iterated.
    pub fn is_solo(self) -> bool {
        matches!(
            self,
            PeerKind::AudioMixer | PeerKind::AvatarMixer | PeerKind::ContentServer
        )
    }

    /// Kinds that are always directly reachable and get their public endpoint
    ///  activated on insert, without waiting for a ping exchange.
    pub fn is_directly_reachable(self) -> bool {
        matches!(self, PeerKind::ContentServer | PeerKind::AvatarMixer)
    }
}
