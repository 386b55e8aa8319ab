use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::protocol::packets::MAX_PACKET_SIZE;
use crate::wire::peer_kind::PeerKind;

#[derive(Debug)]
pub struct PresenceConfig {
    /// the peer kind this process announces itself as
    pub owner_kind: PeerKind,
    /// 0 lets the OS pick a free port
    pub listen_port: u16,
    pub rendezvous_addr: SocketAddr,

    /// peer kinds the rendezvous server should tell us about
    pub interest_kinds: Vec<PeerKind>,

    pub stun_server_host: String,
    pub stun_server_port: u16,
    /// a fresh STUN exchange every Nth check-in catches NAT rebinding
    pub check_ins_per_stun_refresh: u64,

    pub check_in_interval: Duration,
    /// consecutive unacknowledged check-ins before a `CheckInsUnanswered`
    ///  event is raised (whether to terminate is the application's call)
    pub max_unanswered_check_ins: u32,

    /// peers silent for longer than this are marked dead by the reaper
    pub silence_threshold: Duration,
    /// Kinds the reaper never evicts. Content servers are long-lived and do
    ///  not send regular traffic, so they stay exempt by default; clearing
    ///  this set makes every kind subject to eviction.
    pub reaper_exempt: FxHashSet<PeerKind>,

    /// how often peers without a confirmed endpoint get pinged on both candidates
    pub ping_interval: Duration,

    pub max_packet_size: usize,
}

impl PresenceConfig {
    pub fn new(
        owner_kind: PeerKind,
        listen_port: u16,
        rendezvous_addr: SocketAddr,
    ) -> PresenceConfig {
        PresenceConfig {
            owner_kind,
            listen_port,
            rendezvous_addr,
            interest_kinds: Vec::new(),
            stun_server_host: "stun.l.google.com".to_string(),
            stun_server_port: 19302,
            check_ins_per_stun_refresh: 5,
            check_in_interval: Duration::from_secs(1),
            max_unanswered_check_ins: 5,
            silence_threshold: Duration::from_secs(2),
            reaper_exempt: [PeerKind::ContentServer].into_iter().collect(),
            ping_interval: Duration::from_secs(1),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}
