// Timeout Reaper
//
// Safety net for peers that died without announcing it or whose channel went
// quiet: every `check_interval`, online peers whose last trustworthy
// confirmation is older than `timeout_window` are proposed for demotion. The
// actor re-checks before applying, so a confirmation racing the sweep wins.

use crate::command::{Command, WeakCommandSender};
use crate::store::Snapshot;
use peerwatch_core::PeerId;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Online peers silent for strictly longer than `timeout`, with the
/// confirmation timestamp the decision was based on.
pub fn expired_peers(snapshot: &Snapshot, now: Instant, timeout: Duration) -> Vec<(PeerId, Instant)> {
    let mut expired: Vec<(PeerId, Instant)> = snapshot
        .values()
        .filter(|p| p.is_online())
        .filter_map(|p| {
            let confirmed_at = p.last_confirmed_at?;
            (now.saturating_duration_since(confirmed_at) > timeout)
                .then(|| (p.peer.clone(), confirmed_at))
        })
        .collect();
    expired.sort_by(|a, b| a.0.cmp(&b.0));
    expired
}

pub(crate) fn spawn_reaper(
    check_interval: Duration,
    timeout_window: Duration,
    snapshot: watch::Receiver<Snapshot>,
    commands: WeakCommandSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(
            "Timeout reaper started (check {:?}, timeout {:?})",
            check_interval,
            timeout_window
        );

        'sweep: loop {
            ticker.tick().await;
            let current = snapshot.borrow().clone();
            let expired = expired_peers(&current, Instant::now(), timeout_window);
            if expired.is_empty() {
                continue;
            }

            let Some(tx) = commands.upgrade() else {
                break;
            };
            for (peer, confirmed_at) in expired {
                if tx.send(Command::Expire { peer, confirmed_at }).is_err() {
                    break 'sweep;
                }
            }
        }
        tracing::debug!("Timeout reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerPresence, PresenceStatus};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn online(peer: &str, confirmed_at: Instant) -> (PeerId, PeerPresence) {
        let peer = PeerId::from(peer);
        let presence = PeerPresence {
            status: PresenceStatus::Online,
            last_confirmed_at: Some(confirmed_at),
            ..PeerPresence::unknown(peer.clone())
        };
        (peer, presence)
    }

    #[test]
    fn test_expiry_is_strictly_after_timeout() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(90);
        let snap: Snapshot = Arc::new(HashMap::from([online("a", t0)]));

        assert!(expired_peers(&snap, t0 + Duration::from_secs(90), timeout).is_empty());
        let expired = expired_peers(&snap, t0 + Duration::from_secs(91), timeout);
        assert_eq!(expired, vec![(PeerId::from("a"), t0)]);
    }

    #[test]
    fn test_offline_peers_are_not_reaped() {
        let t0 = Instant::now();
        let (peer, mut presence) = online("a", t0);
        presence.status = PresenceStatus::Offline;
        let snap: Snapshot = Arc::new(HashMap::from([(peer, presence)]));
        assert!(expired_peers(&snap, t0 + Duration::from_secs(600), Duration::from_secs(90)).is_empty());
    }
}
