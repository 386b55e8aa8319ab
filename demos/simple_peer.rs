use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use presence::protocol::config::PresenceConfig;
use presence::protocol::PresenceService;
use presence::wire::peer_kind::PeerKind;
use tokio::select;
use tokio::sync::watch;
use tokio::time;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    rendezvous_address: String,

    #[clap(long, default_value_t = 0)]
    listen_port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let rendezvous_addr: SocketAddr = args.rendezvous_address.parse()?;

    let mut config = PresenceConfig::new(PeerKind::Agent, args.listen_port, rendezvous_addr);
    config.interest_kinds = vec![
        PeerKind::Agent,
        PeerKind::AudioMixer,
        PeerKind::AvatarMixer,
        PeerKind::ContentServer,
    ];

    let service = Arc::new(PresenceService::new(Arc::new(config)).await?);
    let mut events = service.subscribe();

    let (stop_sender, stop) = watch::channel(false);

    select! {
        result = service.run(stop) => result,
        _ = log_events_and_stats(service.clone(), &mut events) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            stop_sender.send(true)?;
            Ok(())
        }
    }
}

async fn log_events_and_stats(
    service: Arc<PresenceService>,
    events: &mut tokio::sync::broadcast::Receiver<presence::registry::events::PeerEvent>,
) {
    let mut stats_ticks = time::interval(Duration::from_secs(5));
    loop {
        select! {
            event = events.recv() => {
                if let Ok(event) = event {
                    info!("{:?}", event);
                }
            }
            _ = stats_ticks.tick() => {
                info!("state: {:?}, public address: {:?}", service.presence_state().await, service.public_addr().await);
                for peer in service.peer_summaries().await {
                    info!(
                        "  {:?} {:?} active={:?} ping={:?} {:.1} packets/s {:.1} kbit/s",
                        peer.kind,
                        peer.id,
                        peer.active_addr,
                        peer.ping_millis,
                        peer.average_packets_per_second,
                        peer.average_kilobits_per_second,
                    );
                }
            }
        }
    }
}
