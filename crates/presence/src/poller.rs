// Active Poller
//
// Every `poll_interval` asks the actor to unsubscribe/resubscribe each peer
// that currently looks online, forcing the channel to produce a fresh report.
// Offline and unknown peers are left alone. The first tick is delayed by one
// full interval so freshly loaded peers do not immediately re-trigger stale
// cache answers.

use crate::command::{Command, WeakCommandSender};
use crate::store::Snapshot;
use peerwatch_core::PeerId;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Peers to refresh on this tick, in a stable order
pub fn poll_targets(snapshot: &Snapshot) -> Vec<PeerId> {
    let mut peers: Vec<PeerId> = snapshot
        .values()
        .filter(|p| p.is_online())
        .map(|p| p.peer.clone())
        .collect();
    peers.sort();
    peers
}

pub(crate) fn spawn_poller(
    poll_interval: Duration,
    snapshot: watch::Receiver<Snapshot>,
    commands: WeakCommandSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("Active poller started (interval {:?})", poll_interval);

        loop {
            ticker.tick().await;
            let current = snapshot.borrow().clone();
            let peers = poll_targets(&current);
            if peers.is_empty() {
                continue;
            }

            let Some(tx) = commands.upgrade() else {
                break;
            };
            tracing::debug!("Polling {} online peers", peers.len());
            if tx.send(Command::Poll { peers }).is_err() {
                break;
            }
        }
        tracing::debug!("Active poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerPresence, PresenceStatus};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn snapshot(entries: &[(&str, PresenceStatus)]) -> Snapshot {
        let map: HashMap<PeerId, PeerPresence> = entries
            .iter()
            .map(|(peer, status)| {
                let peer = PeerId::from(*peer);
                let presence = PeerPresence {
                    status: *status,
                    ..PeerPresence::unknown(peer.clone())
                };
                (peer, presence)
            })
            .collect();
        Arc::new(map)
    }

    #[test]
    fn test_only_online_peers_are_polled() {
        let snap = snapshot(&[
            ("c", PresenceStatus::Online),
            ("a", PresenceStatus::Online),
            ("b", PresenceStatus::Offline),
            ("d", PresenceStatus::Unknown),
        ]);
        assert_eq!(poll_targets(&snap), vec![PeerId::from("a"), PeerId::from("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_interval() {
        let (_snap_tx, snap_rx) = watch::channel(snapshot(&[("a", PresenceStatus::Online)]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_poller(Duration::from_secs(60), snap_rx, tx.downgrade());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.try_recv() {
            Ok(Command::Poll { peers }) => assert_eq!(peers, vec![PeerId::from("a")]),
            other => panic!("expected poll command, got {:?}", other),
        }
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_actor_is_gone() {
        let (_snap_tx, snap_rx) = watch::channel(snapshot(&[("a", PresenceStatus::Online)]));
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let handle = spawn_poller(Duration::from_secs(1), snap_rx, tx.downgrade());
        drop(rx);
        drop(tx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
