// Subscription Tracker
//
// Remembers when this engine last asked the channel to subscribe to each peer.
// Pure bookkeeping owned by the engine actor.

use peerwatch_core::PeerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    records: HashMap<PeerId, Instant>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite the subscribe timestamp for `peer`
    pub fn record_subscribe(&mut self, peer: &PeerId, now: Instant) {
        self.records.insert(peer.clone(), now);
    }

    /// Time elapsed since the last subscribe, `Duration::MAX` when there is none.
    pub fn time_since_subscribe(&self, peer: &PeerId, now: Instant) -> Duration {
        match self.records.get(peer) {
            Some(at) => now.saturating_duration_since(*at),
            None => Duration::MAX,
        }
    }

    pub fn last_subscribe_at(&self, peer: &PeerId) -> Option<Instant> {
        self.records.get(peer).copied()
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.records.remove(peer);
    }

    /// Bulk clear on account switch or logout
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_peer_is_infinitely_old() {
        let tracker = SubscriptionTracker::new();
        let elapsed = tracker.time_since_subscribe(&PeerId::from("ghost"), Instant::now());
        assert_eq!(elapsed, Duration::MAX);
    }

    #[test]
    fn test_resubscribe_overwrites() {
        let mut tracker = SubscriptionTracker::new();
        let peer = PeerId::from("alice");
        let t0 = Instant::now();
        tracker.record_subscribe(&peer, t0);
        tracker.record_subscribe(&peer, t0 + Duration::from_secs(60));

        let elapsed = tracker.time_since_subscribe(&peer, t0 + Duration::from_secs(61));
        assert_eq!(elapsed, Duration::from_secs(1));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_signal_before_subscribe_counts_as_zero() {
        let mut tracker = SubscriptionTracker::new();
        let peer = PeerId::from("alice");
        let t0 = Instant::now();
        tracker.record_subscribe(&peer, t0 + Duration::from_secs(5));
        assert_eq!(tracker.time_since_subscribe(&peer, t0), Duration::ZERO);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut tracker = SubscriptionTracker::new();
        let now = Instant::now();
        tracker.record_subscribe(&PeerId::from("a"), now);
        tracker.record_subscribe(&PeerId::from("b"), now);

        tracker.forget(&PeerId::from("a"));
        assert!(tracker.last_subscribe_at(&PeerId::from("a")).is_none());
        assert_eq!(tracker.len(), 1);

        tracker.clear();
        assert!(tracker.is_empty());
    }
}
