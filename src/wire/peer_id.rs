use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::wire::codec::WireError;

pub const PEER_ID_LEN: usize = 16;

/// Identity of a peer within a session: a 16-byte RFC 4122 UUID, immutable
///  once assigned. A peer that leaves and returns shows up under a fresh
///  identity rather than resurrecting the old record.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(Uuid);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerId {
    pub fn random() -> PeerId {
        PeerId(Uuid::new_v4())
    }

    pub fn nil() -> PeerId {
        PeerId(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> PeerId {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<PeerId, WireError> {
        if buf.remaining() < PEER_ID_LEN {
            return Err(WireError::BufferTooSmall("peer id"));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(PeerId(Uuid::from_bytes(bytes)))
    }
}
