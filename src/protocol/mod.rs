use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time;
use tracing::{debug, info, warn};

use crate::protocol::config::PresenceConfig;
use crate::protocol::packets::{
    BulkPayload, CheckIn, KillPeer, Ping, PingReply, PingScope, RegistryUpdate,
};
use crate::protocol::stun::StunClient;
use crate::registry::events::{CheckInsUnansweredData, PeerEvent, PeerEventNotifier};
use crate::registry::peer::Peer;
use crate::registry::registry::{PayloadFactory, PeerRegistry};
use crate::transport::UdpTransport;
use crate::util::micros_timestamp_now;
use crate::wire::codec::{check_header, WireError, HEADER_LEN};
use crate::wire::packet_kind::PacketKind;
use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

pub mod config;
pub mod packets;
pub mod stun;

/// Where this process stands with the rendezvous server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PresenceState {
    Unregistered,
    AwaitingStun,
    CheckingIn,
    Registered,
}

/// Session-level mutable state shared between the check-in loop and the
///  receive path.
struct SessionState {
    session_id: PeerId,
    rendezvous_addr: SocketAddr,
    local_addr: SocketAddr,
    stun: StunClient,
    stun_server_addr: Option<SocketAddr>,
    presence_state: PresenceState,
    unanswered_check_ins: u32,
    check_ins_sent: u64,
}

/// Read-only snapshot of one peer for stats reporting.
#[derive(Clone, Debug)]
pub struct PeerSummary {
    pub id: PeerId,
    pub kind: PeerKind,
    pub public_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub active_addr: Option<SocketAddr>,
    pub ping_millis: Option<u32>,
    pub average_packets_per_second: f64,
    pub average_kilobits_per_second: f64,
}
impl PeerSummary {
    fn of(peer: &Peer, now_micros: u64) -> PeerSummary {
        PeerSummary {
            id: peer.id(),
            kind: peer.kind(),
            public_addr: peer.endpoints().public_addr,
            local_addr: peer.endpoints().local_addr,
            active_addr: peer.endpoints().active_addr(),
            ping_millis: peer.ping_millis(),
            average_packets_per_second: peer.average_packets_per_second(now_micros),
            average_kilobits_per_second: peer.average_kilobits_per_second(now_micros),
        }
    }
}

/// This is the presence protocol's public API: it owns the socket, the peer
///  registry and the session state, and runs the check-in, reaper, pinger
///  and receive loops.
pub struct PresenceService {
    pub config: Arc<PresenceConfig>,
    transport: Arc<UdpTransport>,
    registry: Arc<RwLock<PeerRegistry>>,
    event_notifier: Arc<PeerEventNotifier>,
    session: Arc<RwLock<SessionState>>,
}

impl PresenceService {
    pub async fn new(config: Arc<PresenceConfig>) -> anyhow::Result<PresenceService> {
        let transport = Arc::new(UdpTransport::bind(config.listen_port).await?);
        let event_notifier = Arc::new(PeerEventNotifier::new());
        let registry = Arc::new(RwLock::new(PeerRegistry::new(
            config.reaper_exempt.clone(),
            event_notifier.clone(),
        )));

        let session_id = PeerId::random();
        let local_addr =
            discover_local_addr(config.rendezvous_addr, transport.local_port()).await?;
        info!(
            "presence session {:?} as {:?}, local address {}, rendezvous {}",
            session_id, config.owner_kind, local_addr, config.rendezvous_addr
        );

        let session = Arc::new(RwLock::new(SessionState {
            session_id,
            rendezvous_addr: config.rendezvous_addr,
            local_addr,
            stun: StunClient::new(),
            stun_server_addr: None,
            presence_state: PresenceState::Unregistered,
            unanswered_check_ins: 0,
            check_ins_sent: 0,
        }));

        Ok(PresenceService {
            config,
            transport,
            registry,
            event_notifier,
            session,
        })
    }

    /// Runs all protocol loops until the stop signal fires; a stop request
    ///  takes effect within one sleep interval.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        select! {
            r = run_receive(self.transport.clone(), self.registry.clone(), self.session.clone(), stop.clone()) => r,
            r = run_check_in(self.config.clone(), self.transport.clone(), self.session.clone(), self.event_notifier.clone(), stop.clone()) => r,
            r = run_reaper(self.config.clone(), self.registry.clone(), stop.clone()) => r,
            r = run_pinger(self.config.clone(), self.transport.clone(), self.registry.clone(), stop) => r,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_notifier.subscribe()
    }

    pub fn local_port(&self) -> u16 {
        self.transport.local_port()
    }

    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    pub async fn session_id(&self) -> PeerId {
        self.session.read().await.session_id
    }

    pub async fn presence_state(&self) -> PresenceState {
        self.session.read().await.presence_state
    }

    /// check-ins since the rendezvous server last answered
    pub async fn unanswered_check_ins(&self) -> u32 {
        self.session.read().await.unanswered_check_ins
    }

    pub async fn public_addr(&self) -> Option<SocketAddr> {
        self.session.read().await.stun.public_addr()
    }

    pub async fn set_payload_factory(&self, factory: PayloadFactory) {
        self.registry.write().await.set_payload_factory(factory);
    }

    pub async fn peer_summaries(&self) -> Vec<PeerSummary> {
        let now = micros_timestamp_now();
        self.registry
            .read()
            .await
            .alive_peers()
            .map(|p| PeerSummary::of(p, now))
            .collect()
    }

    /// the single alive instance of a solo kind, e.g. the audio mixer
    pub async fn solo_peer(&self, kind: PeerKind) -> Option<PeerSummary> {
        let now = micros_timestamp_now();
        self.registry
            .read()
            .await
            .solo_of_kind(kind)
            .map(|p| PeerSummary::of(p, now))
    }

    /// Sends `payload` to every alive peer of a matching kind with a
    ///  confirmed endpoint, returning how many sends happened. Peers whose
    ///  endpoint is not confirmed yet get a ping on both candidates instead
    ///  so a later broadcast can reach them.
    pub async fn broadcast(
        &self,
        payload: &[u8],
        kind_filter: &[PeerKind],
    ) -> anyhow::Result<usize> {
        if payload.len() > self.config.max_packet_size {
            return Err(WireError::PayloadTooLarge {
                actual: payload.len(),
                max: self.config.max_packet_size,
            }
            .into());
        }

        let mut active = Vec::new();
        let mut unconfirmed = Vec::new();
        {
            let registry = self.registry.read().await;
            for peer in registry
                .alive_peers()
                .filter(|p| kind_filter.contains(&p.kind()))
            {
                match peer.endpoints().active_addr() {
                    Some(addr) => active.push(addr),
                    None => unconfirmed.push((
                        peer.endpoints().public_addr,
                        peer.endpoints().local_addr,
                    )),
                }
            }
        }

        for addr in &active {
            self.transport.send_to(*addr, payload).await;
        }
        for (public_addr, local_addr) in unconfirmed {
            send_ping(&self.transport, public_addr, PingScope::Public).await;
            send_ping(&self.transport, local_addr, PingScope::Local).await;
        }

        Ok(active.len())
    }

    /// Switches to a different rendezvous server: all peer records (and
    ///  their payloads) are dropped and registration starts over.
    pub async fn change_rendezvous(&self, rendezvous_addr: SocketAddr) {
        info!("changing rendezvous server to {}", rendezvous_addr);
        self.registry.write().await.reset();

        let mut session = self.session.write().await;
        session.rendezvous_addr = rendezvous_addr;
        session.presence_state = PresenceState::Unregistered;
        session.unanswered_check_ins = 0;
        session.check_ins_sent = 0;
    }
}

/// UDP connect sends nothing, it just makes the OS pick the route and
///  reveal the local interface address.
async fn discover_local_addr(
    rendezvous_addr: SocketAddr,
    local_port: u16,
) -> anyhow::Result<SocketAddr> {
    let probe = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect(rendezvous_addr).await?;
    Ok(SocketAddr::new(probe.local_addr()?.ip(), local_port))
}

async fn run_check_in(
    config: Arc<PresenceConfig>,
    transport: Arc<UdpTransport>,
    session: Arc<RwLock<SessionState>>,
    event_notifier: Arc<PeerEventNotifier>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticks = time::interval(config.check_in_interval);
    loop {
        select! {
            _ = ticks.tick() => {
                do_check_in(&config, &transport, &session, &event_notifier).await
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

async fn do_check_in(
    config: &PresenceConfig,
    transport: &UdpTransport,
    session: &RwLock<SessionState>,
    event_notifier: &PeerEventNotifier,
) {
    let mut session = session.write().await;

    if session.stun.needs_discovery() {
        session.presence_state = PresenceState::AwaitingStun;
        send_stun_request(config, transport, &mut session).await;
        return;
    }

    // a fresh STUN exchange every Nth check-in catches NAT rebinding
    if !session.stun.has_fallen_back()
        && session.check_ins_sent % config.check_ins_per_stun_refresh == 0
    {
        send_stun_request(config, transport, &mut session).await;
    }

    // a zero public address tells the rendezvous server to use the source
    //  address it observes on this very packet
    let public_addr = session.stun.public_addr().unwrap_or(SocketAddr::V4(
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, transport.local_port()),
    ));

    let check_in = CheckIn {
        owner_kind: config.owner_kind,
        id: session.session_id,
        public_addr,
        local_addr: session.local_addr,
        interest_kinds: config.interest_kinds.clone(),
    };
    let mut buf = BytesMut::new();
    if let Err(e) = check_in.ser(&mut buf) {
        warn!("cannot build check-in packet: {}", e);
        return;
    }
    debug!(
        "sending check-in ({} bytes) to {}",
        buf.len(),
        session.rendezvous_addr
    );
    transport.send_to(session.rendezvous_addr, &buf).await;
    session.check_ins_sent += 1;

    if session.presence_state != PresenceState::Registered {
        session.presence_state = PresenceState::CheckingIn;
    }

    if session.unanswered_check_ins >= config.max_unanswered_check_ins {
        event_notifier.send_event(PeerEvent::CheckInsUnanswered(CheckInsUnansweredData {
            unanswered_count: session.unanswered_check_ins,
        }));
    }
    session.unanswered_check_ins += 1;
}

async fn send_stun_request(
    config: &PresenceConfig,
    transport: &UdpTransport,
    session: &mut SessionState,
) {
    let stun_server_addr = match session.stun_server_addr {
        Some(addr) => addr,
        None => {
            match UdpTransport::resolve_hostname(&config.stun_server_host, config.stun_server_port)
                .await
            {
                Ok(addr) => {
                    session.stun_server_addr = Some(addr);
                    addr
                }
                Err(e) => {
                    warn!(
                        "cannot resolve STUN server {}: {}",
                        config.stun_server_host, e
                    );
                    return;
                }
            }
        }
    };

    let request = session.stun.build_binding_request();
    debug!("sending STUN binding request to {}", stun_server_addr);
    transport.send_to(stun_server_addr, &request).await;
}

async fn run_reaper(
    config: Arc<PresenceConfig>,
    registry: Arc<RwLock<PeerRegistry>>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticks = time::interval(config.silence_threshold);
    loop {
        select! {
            _ = ticks.tick() => {
                let num_reaped = registry.write().await.reap_silent_peers(
                    micros_timestamp_now(),
                    config.silence_threshold.as_micros() as u64,
                );
                if num_reaped > 0 {
                    debug!("reaped {} silent peers", num_reaped);
                }
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

async fn run_pinger(
    config: Arc<PresenceConfig>,
    transport: Arc<UdpTransport>,
    registry: Arc<RwLock<PeerRegistry>>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticks = time::interval(config.ping_interval);
    loop {
        select! {
            _ = ticks.tick() => ping_unconfirmed_peers(&transport, &registry).await,
            _ = stop.changed() => return Ok(()),
        }
    }
}

/// pings both candidate addresses of every peer whose reachable endpoint is
///  not confirmed yet
async fn ping_unconfirmed_peers(transport: &UdpTransport, registry: &RwLock<PeerRegistry>) {
    let candidates: Vec<(SocketAddr, SocketAddr)> = registry
        .read()
        .await
        .alive_peers()
        .filter(|p| p.endpoints().active().is_none())
        .map(|p| (p.endpoints().public_addr, p.endpoints().local_addr))
        .collect();

    for (public_addr, local_addr) in candidates {
        send_ping(transport, public_addr, PingScope::Public).await;
        send_ping(transport, local_addr, PingScope::Local).await;
    }
}

async fn send_ping(transport: &UdpTransport, addr: SocketAddr, scope: PingScope) {
    let mut buf = BytesMut::new();
    Ping {
        scope,
        timestamp_micros: micros_timestamp_now(),
    }
    .ser(&mut buf);
    transport.send_to(addr, &buf).await;
}

async fn run_receive(
    transport: Arc<UdpTransport>,
    registry: Arc<RwLock<PeerRegistry>>,
    session: Arc<RwLock<SessionState>>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        select! {
            received = transport.recv() => {
                if let Some((sender, packet)) = received {
                    if let Err(e) = process_incoming_packet(&transport, &registry, &session, sender, &packet).await {
                        debug!("dropping packet from {}: {}", sender, e);
                    }
                }
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

async fn process_incoming_packet(
    transport: &UdpTransport,
    registry: &RwLock<PeerRegistry>,
    session: &RwLock<SessionState>,
    sender: SocketAddr,
    packet: &[u8],
) -> anyhow::Result<()> {
    let kind = check_header(packet)?;
    let now = micros_timestamp_now();

    // any packet from a known candidate address proves liveness
    if let Some(peer) = registry.write().await.find_by_address_mut(sender) {
        peer.record_inbound_bytes(now, packet.len() as u64);
    }

    let payload = &packet[HEADER_LEN..];
    match kind {
        PacketKind::StunResponse => on_stun_response(session, packet).await,
        PacketKind::RegistryUpdate => {
            on_registry_update(transport, registry, session, payload, now).await?
        }
        PacketKind::Ping => on_ping(transport, sender, payload, now).await?,
        PacketKind::PingReply => on_ping_reply(registry, sender, payload, now).await?,
        PacketKind::KillPeer => on_kill_peer(registry, payload).await?,
        PacketKind::BulkPayload => on_bulk_payload(registry, sender, payload, now).await?,
        PacketKind::CheckIn => {
            debug!("ignoring check-in from {} - this is not a rendezvous server", sender)
        }
    }
    Ok(())
}

/// STUN responses keep their own framing, so this gets the whole packet
///  rather than the part after our header.
async fn on_stun_response(session: &RwLock<SessionState>, packet: &[u8]) {
    let mut session = session.write().await;
    if session.stun.process_response(packet).is_some()
        && session.presence_state == PresenceState::AwaitingStun
    {
        session.presence_state = PresenceState::CheckingIn;
    }
}

async fn on_registry_update(
    transport: &UdpTransport,
    registry: &RwLock<PeerRegistry>,
    session: &RwLock<SessionState>,
    mut payload: &[u8],
    now_micros: u64,
) -> anyhow::Result<()> {
    let update = RegistryUpdate::try_deser(&mut payload)?;

    let rendezvous_addr = {
        let mut session = session.write().await;
        session.unanswered_check_ins = 0;
        session.presence_state = PresenceState::Registered;
        session.rendezvous_addr
    };

    {
        let mut registry = registry.write().await;
        for entry in update.entries {
            // a zero public address means "same host as the rendezvous server"
            let public_addr = if entry.public_addr.ip().is_unspecified() {
                SocketAddr::new(rendezvous_addr.ip(), entry.public_addr.port())
            }
            else {
                entry.public_addr
            };

            registry.insert_or_update(
                entry.id,
                entry.kind,
                public_addr,
                entry.local_addr,
                now_micros,
            );
        }
    }

    // confirm reachability of fresh peers right away instead of waiting for
    //  the next pinger tick
    ping_unconfirmed_peers(transport, registry).await;
    Ok(())
}

async fn on_ping(
    transport: &UdpTransport,
    sender: SocketAddr,
    mut payload: &[u8],
    now_micros: u64,
) -> anyhow::Result<()> {
    let ping = Ping::try_deser(&mut payload)?;

    let mut buf = BytesMut::new();
    PingReply::answering(&ping, now_micros).ser(&mut buf);
    transport.send_to(sender, &buf).await;
    Ok(())
}

async fn on_ping_reply(
    registry: &RwLock<PeerRegistry>,
    sender: SocketAddr,
    mut payload: &[u8],
    now_micros: u64,
) -> anyhow::Result<()> {
    let reply = PingReply::try_deser(&mut payload)?;

    let mut registry = registry.write().await;
    let Some(peer) = registry.find_by_address_mut(sender) else {
        debug!("ping reply from unknown peer {}", sender);
        return Ok(());
    };

    // a local confirmation wins over an already-active public endpoint
    match reply.scope {
        PingScope::Local => peer.endpoints_mut().activate_local(),
        PingScope::Public => {
            if peer.endpoints().active().is_none() {
                peer.endpoints_mut().activate_public();
            }
        }
    }

    let (ping_millis, clock_skew_micros) = ping_stats(
        reply.ping_timestamp_micros,
        reply.reply_timestamp_micros,
        now_micros,
    );
    peer.set_ping(ping_millis, clock_skew_micros);
    debug!(
        "confirmed {:?} endpoint of {:?}, ping {} ms",
        reply.scope,
        peer.id(),
        ping_millis
    );
    Ok(())
}

/// Round-trip time from our echoed send timestamp; clock skew as the
///  difference between the peer's reply timestamp and where our own clock
///  puts the middle of the exchange.
fn ping_stats(
    ping_timestamp_micros: u64,
    reply_timestamp_micros: u64,
    now_micros: u64,
) -> (u32, i64) {
    let round_trip_micros = now_micros.saturating_sub(ping_timestamp_micros);
    let one_way_micros = round_trip_micros / 2;
    let expected_reply_micros = ping_timestamp_micros + one_way_micros;
    let clock_skew_micros = reply_timestamp_micros as i64 - expected_reply_micros as i64;

    ((round_trip_micros / 1000) as u32, clock_skew_micros)
}

async fn on_kill_peer(
    registry: &RwLock<PeerRegistry>,
    mut payload: &[u8],
) -> anyhow::Result<()> {
    let kill = KillPeer::try_deser(&mut payload)?;
    registry.write().await.mark_dead(kill.id);
    Ok(())
}

async fn on_bulk_payload(
    registry: &RwLock<PeerRegistry>,
    sender: SocketAddr,
    mut payload: &[u8],
    now_micros: u64,
) -> anyhow::Result<()> {
    let bulk = BulkPayload::try_deser(&mut payload)?;

    let mut registry = registry.write().await;
    for (id, slice) in bulk.slices {
        if registry.find_by_id(id).is_none() {
            // payload for a peer the rendezvous server has not told us about
            //  yet - track it under its announced identity right away
            registry.insert_or_update(id, PeerKind::Agent, sender, sender, now_micros);
        }
        registry.ensure_payload(id);

        let Some(peer) = registry.find_by_id_mut(id) else {
            continue;
        };
        peer.record_inbound_bytes(now_micros, slice.len() as u64);
        if let Some(handler) = peer.payload_mut() {
            if let Err(e) = handler.on_payload(&slice) {
                warn!("error parsing payload for peer {:?}: {}", id, e);
            }
        }
    }
    Ok(())
}
