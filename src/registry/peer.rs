use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use crate::util::moving_average::{SampleWindow, BANDWIDTH_WINDOW};
use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

/// Domain-specific payload handler attached to a peer by the enclosing
///  application. The registry owns the handler exclusively and drops it with
///  the record; the presence protocol only routes payload slices to it.
pub trait PeerPayload: Send + Sync {
    fn on_payload(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Which of a peer's two candidate addresses has been confirmed reachable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActiveEndpoint {
    Public,
    Local,
}

/// The two candidate addresses of a peer plus the active selector. The
///  selector stays `None` until a ping exchange (or first inbound data)
///  confirms which candidate actually reaches the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointPair {
    pub public_addr: SocketAddr,
    pub local_addr: SocketAddr,
    active: Option<ActiveEndpoint>,
}
impl EndpointPair {
    pub fn new(public_addr: SocketAddr, local_addr: SocketAddr) -> EndpointPair {
        EndpointPair {
            public_addr,
            local_addr,
            active: None,
        }
    }

    pub fn active(&self) -> Option<ActiveEndpoint> {
        self.active
    }

    /// the confirmed-reachable address, if any
    pub fn active_addr(&self) -> Option<SocketAddr> {
        match self.active {
            Some(ActiveEndpoint::Public) => Some(self.public_addr),
            Some(ActiveEndpoint::Local) => Some(self.local_addr),
            None => None,
        }
    }

    pub fn activate_public(&mut self) {
        self.active = Some(ActiveEndpoint::Public);
    }

    pub fn activate_local(&mut self) {
        self.active = Some(ActiveEndpoint::Local);
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }
}

/// A single tracked remote endpoint: identity, candidate addresses, liveness
///  timestamps, bandwidth estimate, and the opaque payload slot.
pub struct Peer {
    id: PeerId,
    kind: PeerKind,
    endpoints: EndpointPair,
    wake_time_micros: u64,
    last_heard_micros: u64,
    bandwidth: Option<SampleWindow<BANDWIDTH_WINDOW>>,
    ping_millis: Option<u32>,
    clock_skew_micros: i64,
    alive: bool,
    payload: Option<Box<dyn PeerPayload>>,
}
impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Peer{{{:?} {:?} public={} local={} active={:?} alive={}}}",
            self.id,
            self.kind,
            self.endpoints.public_addr,
            self.endpoints.local_addr,
            self.endpoints.active(),
            self.alive,
        )
    }
}

impl Peer {
    pub fn new(
        id: PeerId,
        kind: PeerKind,
        public_addr: SocketAddr,
        local_addr: SocketAddr,
        now_micros: u64,
    ) -> Peer {
        Peer {
            id,
            kind,
            endpoints: EndpointPair::new(public_addr, local_addr),
            wake_time_micros: now_micros,
            last_heard_micros: now_micros,
            bandwidth: None,
            ping_millis: None,
            clock_skew_micros: 0,
            alive: true,
            payload: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn endpoints(&self) -> &EndpointPair {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointPair {
        &mut self.endpoints
    }

    pub fn wake_time_micros(&self) -> u64 {
        self.wake_time_micros
    }

    pub fn last_heard_micros(&self) -> u64 {
        self.last_heard_micros
    }

    pub fn ping_millis(&self) -> Option<u32> {
        self.ping_millis
    }

    pub fn clock_skew_micros(&self) -> i64 {
        self.clock_skew_micros
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// structural equality used during insert-or-update: two peers of
    ///  different kinds at the same addresses are distinct records
    pub fn matches(&self, public_addr: SocketAddr, local_addr: SocketAddr, kind: PeerKind) -> bool {
        self.endpoints.public_addr == public_addr
            && self.endpoints.local_addr == local_addr
            && self.kind == kind
    }

    /// `last_heard` is monotonically non-decreasing, whatever order inbound
    ///  packet events are processed in
    pub fn record_heard(&mut self, now_micros: u64) {
        if now_micros > self.last_heard_micros {
            self.last_heard_micros = now_micros;
        }
    }

    pub fn record_inbound_bytes(&mut self, now_micros: u64, bytes: u64) {
        self.record_heard(now_micros);
        self.bandwidth
            .get_or_insert_with(SampleWindow::new)
            .record(now_micros, bytes);
    }

    pub fn average_packets_per_second(&self, now_micros: u64) -> f64 {
        match &self.bandwidth {
            Some(window) => window.events_per_second(now_micros),
            None => 0.0,
        }
    }

    pub fn average_kilobits_per_second(&self, now_micros: u64) -> f64 {
        match &self.bandwidth {
            Some(window) => window.kilobits_per_second(now_micros),
            None => 0.0,
        }
    }

    pub fn set_ping(&mut self, ping_millis: u32, clock_skew_micros: i64) {
        self.ping_millis = Some(ping_millis);
        self.clock_skew_micros = clock_skew_micros;
    }

    /// true -> false exactly once, never resurrected. A peer that returns
    ///  shows up as a new record.
    pub(crate) fn kill(&mut self) {
        self.alive = false;
        self.payload = None;
    }

    pub fn payload(&self) -> Option<&dyn PeerPayload> {
        self.payload.as_deref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut dyn PeerPayload> {
        self.payload.as_deref_mut()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn attach_payload(&mut self, payload: Box<dyn PeerPayload>) {
        self.payload = Some(payload);
    }
}
