use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::registry::events::PeerEventNotifier;
use crate::registry::registry::PeerRegistry;
use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

/// convenience function for unit test code: create a socket address based on
///  a number, the same number generating the same address and different
///  numbers different addresses
pub fn test_socket_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

/// deterministic peer id from a number, for unit test code
pub fn test_peer_id(number: u8) -> PeerId {
    let mut bytes = [0u8; 16];
    bytes[15] = number;
    PeerId::from_bytes(bytes)
}

/// a registry with the default reaper exemption (content servers) and a
///  fresh event notifier nobody listens to
pub fn test_registry() -> PeerRegistry {
    PeerRegistry::new(
        [PeerKind::ContentServer].into_iter().collect(),
        Arc::new(PeerEventNotifier::new()),
    )
}
