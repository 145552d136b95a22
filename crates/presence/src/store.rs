// Presence State Store
//
// The single authoritative peer -> presence map. Only the engine actor holds
// a `StateStore`; everyone else reads the published snapshot or observes the
// fan-out hub. Every mutation republishes the snapshot before notifying the
// hub, so a joining observer never misses a change.

use crate::broadcast::PresenceHub;
use crate::types::{PeerPresence, PresenceStatus};
use peerwatch_core::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Read-only view of every tracked peer
pub type Snapshot = Arc<HashMap<PeerId, PeerPresence>>;

pub struct StateStore {
    entries: HashMap<PeerId, PeerPresence>,
    snapshot_tx: watch::Sender<Snapshot>,
    hub: PresenceHub,
}

impl StateStore {
    pub fn new(broadcast_capacity: usize, observer_grace: Duration) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let hub = PresenceHub::new(snapshot_rx, broadcast_capacity, observer_grace);
        Self {
            entries: HashMap::new(),
            snapshot_tx,
            hub,
        }
    }

    pub fn hub(&self) -> PresenceHub {
        self.hub.clone()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerPresence> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.entries.keys().cloned().collect()
    }

    /// Start tracking `peer` as unknown. Returns false if already tracked.
    pub fn track(&mut self, peer: &PeerId) -> bool {
        if self.entries.contains_key(peer) {
            return false;
        }
        let presence = PeerPresence::unknown(peer.clone());
        self.entries.insert(peer.clone(), presence.clone());
        self.publish_snapshot();
        self.hub.publish(&presence);
        true
    }

    pub fn untrack(&mut self, peer: &PeerId) -> Option<PeerPresence> {
        let removed = self.entries.remove(peer)?;
        self.publish_snapshot();
        self.hub.remove(peer);
        Some(removed)
    }

    /// Mirror the tracker's subscribe timestamp onto the entry
    pub fn note_subscribe(&mut self, peer: &PeerId, at: Instant) {
        let Some(entry) = self.entries.get_mut(peer) else {
            return;
        };
        entry.last_subscribe_at = Some(at);
        self.publish_snapshot();
    }

    /// Apply an accepted signal. Returns true when the visible state changed.
    pub fn apply_signal(
        &mut self,
        peer: &PeerId,
        online: bool,
        observed_at: Instant,
        annotation: Option<String>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(peer) else {
            return false;
        };
        let before = entry.clone();
        if online {
            entry.status = PresenceStatus::Online;
            entry.last_confirmed_at = Some(observed_at);
        } else {
            entry.status = PresenceStatus::Offline;
        }
        entry.annotation = annotation;

        let changed = !before.same_visible_state(entry);
        if changed || before != *entry {
            let updated = entry.clone();
            self.publish_snapshot();
            self.hub.publish(&updated);
        }
        changed
    }

    /// Demote an online peer to offline. Returns false if it was not online.
    pub fn expire(&mut self, peer: &PeerId) -> bool {
        let Some(entry) = self.entries.get_mut(peer) else {
            return false;
        };
        if !entry.is_online() {
            return false;
        }
        entry.status = PresenceStatus::Offline;
        let updated = entry.clone();
        self.publish_snapshot();
        self.hub.publish(&updated);
        true
    }

    /// Drop every entry at once (account switch, suspend, shutdown)
    pub fn reset(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        self.publish_snapshot();
        self.hub.reset();
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.entries.clone()));
    }
}
