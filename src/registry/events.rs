use tokio::sync::broadcast;
use tracing::trace;

use crate::wire::peer_id::PeerId;
use crate::wire::peer_kind::PeerKind;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerEvent {
    PeerAdded(PeerAddedData),
    PeerRemoved(PeerRemovedData),
    /// the rendezvous server has not acknowledged the configured maximum of
    ///  consecutive check-ins. Whether to terminate is the application's
    ///  decision, this core only reports the fact.
    CheckInsUnanswered(CheckInsUnansweredData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddedData {
    pub id: PeerId,
    pub kind: PeerKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRemovedData {
    pub id: PeerId,
    pub kind: PeerKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckInsUnansweredData {
    pub unanswered_count: u32,
}

pub struct PeerEventNotifier {
    sender: broadcast::Sender<PeerEvent>,
}
impl PeerEventNotifier {
    pub fn new() -> PeerEventNotifier {
        let (sender, _) = broadcast::channel(128);

        PeerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: PeerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for PeerEventNotifier {
    fn default() -> Self {
        PeerEventNotifier::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::test_peer_id;

    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let notifier = PeerEventNotifier::new();
        let mut subscription = notifier.subscribe();

        let event = PeerEvent::PeerAdded(PeerAddedData {
            id: test_peer_id(3),
            kind: PeerKind::Agent,
        });
        notifier.send_event(event.clone());

        assert_eq!(subscription.recv().await.unwrap(), event);
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let notifier = PeerEventNotifier::new();
        notifier.send_event(PeerEvent::CheckInsUnanswered(CheckInsUnansweredData {
            unanswered_count: 5,
        }));
    }
}
