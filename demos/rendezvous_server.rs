use std::net::SocketAddr;

use bytes::BytesMut;
use clap::Parser;
use clap_derive::Parser;
use presence::protocol::packets::{CheckIn, RegistryEntry, RegistryUpdate};
use presence::transport::UdpTransport;
use presence::wire::codec::{check_header, HEADER_LEN};
use presence::wire::packet_kind::PacketKind;
use presence::wire::peer_id::PeerId;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 40102)]
    listen_port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct KnownPeer {
    entry: RegistryEntry,
    interest_kinds: Vec<presence::wire::peer_kind::PeerKind>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let transport = UdpTransport::bind(args.listen_port).await?;
    info!("rendezvous server listening on port {}", transport.local_port());

    let mut known_peers: FxHashMap<PeerId, KnownPeer> = FxHashMap::default();

    loop {
        let Some((sender, packet)) = transport.recv().await else {
            continue;
        };

        match check_header(&packet) {
            Ok(PacketKind::CheckIn) => {
                if let Err(e) = on_check_in(&transport, &mut known_peers, sender, &packet).await {
                    warn!("dropping check-in from {}: {}", sender, e);
                }
            }
            Ok(kind) => debug!("ignoring {:?} from {}", kind, sender),
            Err(e) => debug!("dropping packet from {}: {}", sender, e),
        }
    }
}

async fn on_check_in(
    transport: &UdpTransport,
    known_peers: &mut FxHashMap<PeerId, KnownPeer>,
    sender: SocketAddr,
    packet: &[u8],
) -> anyhow::Result<()> {
    let check_in = CheckIn::try_deser(&mut &packet[HEADER_LEN..])?;

    // a zero public address asks us to fill in what we observe
    let public_addr = if check_in.public_addr.ip().is_unspecified() {
        sender
    }
    else {
        check_in.public_addr
    };

    if !known_peers.contains_key(&check_in.id) {
        info!(
            "new {:?} peer {:?} at public {} local {}",
            check_in.owner_kind, check_in.id, public_addr, check_in.local_addr
        );
    }
    known_peers.insert(
        check_in.id,
        KnownPeer {
            entry: RegistryEntry {
                kind: check_in.owner_kind,
                id: check_in.id,
                public_addr,
                local_addr: check_in.local_addr,
            },
            interest_kinds: check_in.interest_kinds.clone(),
        },
    );

    let interest_kinds = &known_peers[&check_in.id].interest_kinds;
    let entries = known_peers
        .values()
        .filter(|p| p.entry.id != check_in.id)
        .filter(|p| interest_kinds.contains(&p.entry.kind))
        .map(|p| p.entry)
        .collect::<Vec<_>>();

    let mut buf = BytesMut::new();
    RegistryUpdate { entries }.ser(&mut buf)?;
    transport.send_to(sender, &buf).await;
    Ok(())
}
