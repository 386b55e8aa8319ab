use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::registry::events::{PeerAddedData, PeerEvent, PeerEventNotifier, PeerRemovedData};
use crate::registry::peer::{Peer, PeerPayload};
use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

pub type PayloadFactory = Box<dyn Fn(&Peer) -> Box<dyn PeerPayload> + Send + Sync>;

/// The set of peers this process currently knows about.
///
/// Records live in a growable arena with stable slots: removal never compacts,
///  it flips the record's alive flag, so a slot index captured during one pass
///  stays valid across later inserts. Iteration silently skips dead slots.
///  Lookup by identity goes through a secondary index which only ever points
///  at alive records; lookup by address is a linear scan over alive slots.
pub struct PeerRegistry {
    peers: Vec<Peer>,
    id_index: FxHashMap<PeerId, usize>,
    reaper_exempt: FxHashSet<PeerKind>,
    event_notifier: Arc<PeerEventNotifier>,
    payload_factory: Option<PayloadFactory>,
}
impl PeerRegistry {
    pub fn new(
        reaper_exempt: FxHashSet<PeerKind>,
        event_notifier: Arc<PeerEventNotifier>,
    ) -> PeerRegistry {
        PeerRegistry {
            peers: Vec::new(),
            id_index: FxHashMap::default(),
            reaper_exempt,
            event_notifier,
            payload_factory: None,
        }
    }

    /// Registers the factory that builds the application's payload handler
    ///  for a peer the first time payload data arrives for it.
    pub fn set_payload_factory(&mut self, factory: PayloadFactory) {
        self.payload_factory = Some(factory);
    }

    /// Inserts a new record or updates the existing alive record with this
    ///  identity, returning true if a record was created.
    ///
    /// On update, changed candidate addresses are applied and the active
    ///  selector is cleared so a fresh ping exchange has to re-confirm
    ///  reachability. On insert, peers whose two candidates are identical
    ///  (same-host setups) and peer kinds that are always directly reachable
    ///  get their public endpoint activated immediately.
    pub fn insert_or_update(
        &mut self,
        id: PeerId,
        kind: PeerKind,
        public_addr: SocketAddr,
        local_addr: SocketAddr,
        now_micros: u64,
    ) -> bool {
        if let Some(&slot) = self.id_index.get(&id) {
            if self.peers[slot].kind() != kind {
                // identity reuse across kinds is a different peer
                warn!(
                    "peer {:?} reappeared as {:?} (was {:?}) - replacing the record",
                    id,
                    kind,
                    self.peers[slot].kind()
                );
                self.mark_dead(id);
            }
            else {
                let peer = &mut self.peers[slot];
                if !peer.matches(public_addr, local_addr, kind) {
                    info!(
                        "peer {:?} changed sockets: public {} -> {}, local {} -> {}",
                        id,
                        peer.endpoints().public_addr,
                        public_addr,
                        peer.endpoints().local_addr,
                        local_addr,
                    );
                    peer.endpoints_mut().public_addr = public_addr;
                    peer.endpoints_mut().local_addr = local_addr;
                    peer.endpoints_mut().deactivate();
                }

                // kinds exempt from the reaper are not expected to send
                //  regular traffic, so a registry update counts as liveness
                if self.reaper_exempt.contains(&kind) {
                    peer.record_heard(now_micros);
                }

                return false;
            }
        }

        let mut peer = Peer::new(id, kind, public_addr, local_addr, now_micros);
        if public_addr == local_addr || kind.is_directly_reachable() {
            peer.endpoints_mut().activate_public();
        }
        info!("added {:?}", peer);

        self.id_index.insert(id, self.peers.len());
        self.peers.push(peer);

        self.event_notifier
            .send_event(PeerEvent::PeerAdded(PeerAddedData { id, kind }));
        true
    }

    pub fn find_by_id(&self, id: PeerId) -> Option<&Peer> {
        self.id_index.get(&id).map(|&slot| &self.peers[slot])
    }

    pub fn find_by_id_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        match self.id_index.get(&id) {
            Some(&slot) => Some(&mut self.peers[slot]),
            None => None,
        }
    }

    /// first alive peer with the given address as one of its candidates
    pub fn find_by_address(&self, addr: SocketAddr) -> Option<&Peer> {
        self.alive_peers()
            .find(|p| p.endpoints().public_addr == addr || p.endpoints().local_addr == addr)
    }

    pub fn find_by_address_mut(&mut self, addr: SocketAddr) -> Option<&mut Peer> {
        self.alive_peers_mut()
            .find(|p| p.endpoints().public_addr == addr || p.endpoints().local_addr == addr)
    }

    /// The single alive instance of a solo kind, if present. Callers must not
    ///  ask this for non-solo kinds - there is no meaningful answer.
    pub fn solo_of_kind(&self, kind: PeerKind) -> Option<&Peer> {
        debug_assert!(kind.is_solo());
        self.alive_peers().find(|p| p.kind() == kind)
    }

    /// restartable forward iteration over alive records, dead slots skipped
    pub fn alive_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_alive())
    }

    pub fn alive_peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut().filter(|p| p.is_alive())
    }

    pub fn num_alive(&self) -> usize {
        self.alive_peers().count()
    }

    pub fn num_slots(&self) -> usize {
        self.peers.len()
    }

    /// Flips the record's alive flag, keeping the slot. Idempotent: a second
    ///  call for the same identity is a no-op.
    pub fn mark_dead(&mut self, id: PeerId) -> bool {
        match self.id_index.remove(&id) {
            Some(slot) => {
                let peer = &mut self.peers[slot];
                info!("removed {:?}", peer);
                let kind = peer.kind();
                peer.kill();

                self.event_notifier
                    .send_event(PeerEvent::PeerRemoved(PeerRemovedData { id, kind }));
                true
            }
            None => false,
        }
    }

    /// Marks dead every non-exempt peer that has been silent longer than the
    ///  threshold, returning how many were reaped.
    pub fn reap_silent_peers(&mut self, now_micros: u64, silence_threshold_micros: u64) -> usize {
        let silent: Vec<PeerId> = self
            .alive_peers()
            .filter(|p| !self.reaper_exempt.contains(&p.kind()))
            .filter(|p| now_micros.saturating_sub(p.last_heard_micros()) > silence_threshold_micros)
            .map(|p| p.id())
            .collect();

        for id in &silent {
            debug!("peer {:?} fell silent", id);
            self.mark_dead(*id);
        }
        silent.len()
    }

    /// Builds and attaches the application's payload handler if the peer does
    ///  not have one yet. No-op without a registered factory.
    pub fn ensure_payload(&mut self, id: PeerId) {
        let Some(&slot) = self.id_index.get(&id) else {
            return;
        };
        if self.peers[slot].has_payload() {
            return;
        }
        if let Some(factory) = &self.payload_factory {
            let payload = factory(&self.peers[slot]);
            self.peers[slot].attach_payload(payload);
        }
    }

    /// drops all records including their payloads, used on rendezvous change
    pub fn reset(&mut self) {
        info!("resetting peer registry ({} slots)", self.peers.len());
        self.peers.clear();
        self.id_index.clear();
    }
}
