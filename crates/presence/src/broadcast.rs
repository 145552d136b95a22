// Presence Fan-out
//
// Multiplexes store changes to any number of observers. The hub keeps a
// last-value cache so late joiners get every current entry replayed at once,
// diffs each change against that cache exactly once, and shares the result
// through a single broadcast channel. When the last observer leaves, the hub
// stays warm for a grace period before dropping its cache and sender.

use crate::store::Snapshot;
use crate::types::{PeerPresence, PresenceStatus};
use futures_util::stream::Stream;
use parking_lot::Mutex;
use peerwatch_core::PeerId;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Stream of presence updates handed to observers
pub type PresenceStream = Pin<Box<dyn Stream<Item = PeerPresence> + Send>>;

struct Live {
    tx: broadcast::Sender<PeerPresence>,
    cache: HashMap<PeerId, PeerPresence>,
}

impl Live {
    fn replay(&self) -> Vec<PeerPresence> {
        let mut entries: Vec<PeerPresence> = self.cache.values().cloned().collect();
        entries.sort_by(|a, b| a.peer.cmp(&b.peer));
        entries
    }
}

#[derive(Default)]
struct HubState {
    live: Option<Live>,
    observers: usize,
    /// Bumped on every join/leave so a pending teardown can tell it is stale
    idle_generation: u64,
}

struct HubInner {
    capacity: usize,
    grace: Duration,
    source: watch::Receiver<Snapshot>,
    state: Mutex<HubState>,
}

/// Fan-out hub handle
#[derive(Clone)]
pub struct PresenceHub {
    inner: Arc<HubInner>,
}

impl PresenceHub {
    /// `source` is used to seed the cache whenever the hub warms up again.
    pub fn new(source: watch::Receiver<Snapshot>, capacity: usize, grace: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                grace,
                source,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Forward an upsert. No-op while cold or when nothing visible changed.
    pub fn publish(&self, presence: &PeerPresence) {
        let mut state = self.inner.state.lock();
        let Some(live) = state.live.as_mut() else {
            return;
        };

        let changed = live
            .cache
            .get(&presence.peer)
            .map_or(true, |cached| !cached.same_visible_state(presence));
        live.cache.insert(presence.peer.clone(), presence.clone());
        if changed {
            // Err only means no receiver is currently subscribed.
            let _ = live.tx.send(presence.clone());
        }
    }

    /// The peer is no longer tracked: observers see it fall back to unknown.
    pub fn remove(&self, peer: &PeerId) {
        let mut state = self.inner.state.lock();
        if let Some(live) = state.live.as_mut() {
            if live.cache.remove(peer).is_some() {
                let _ = live.tx.send(PeerPresence::unknown(peer.clone()));
            }
        }
    }

    /// Drop every cached entry in one step, announcing each as unknown.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if let Some(live) = state.live.as_mut() {
            let mut peers: Vec<PeerId> = live.cache.drain().map(|(peer, _)| peer).collect();
            peers.sort();
            for peer in peers {
                let _ = live.tx.send(PeerPresence::unknown(peer));
            }
        }
    }

    /// Attach a new observer. Current entries are replayed before live updates.
    pub fn observe(&self) -> PresenceStream {
        let (guard, replay, mut rx) = self.join();
        let stream = async_stream::stream! {
            // Peers this observer currently sees in a known state
            let mut shown: HashSet<PeerId> = HashSet::new();
            for presence in replay {
                note_shown(&mut shown, &presence);
                yield presence;
            }
            loop {
                match rx.recv().await {
                    Ok(presence) => {
                        note_shown(&mut shown, &presence);
                        yield presence;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Presence observer lagged by {} updates, resyncing", skipped);
                        let Some((current, fresh)) = guard.hub.resync() else {
                            break;
                        };
                        rx = fresh;

                        // Anything removed while we were behind falls back to unknown.
                        let mut gone: Vec<PeerId> = shown
                            .iter()
                            .filter(|peer| !current.iter().any(|p| &p.peer == *peer))
                            .cloned()
                            .collect();
                        gone.sort();
                        for peer in gone {
                            shown.remove(&peer);
                            yield PeerPresence::unknown(peer);
                        }
                        for presence in current {
                            note_shown(&mut shown, &presence);
                            yield presence;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers
    }

    /// Whether the cache and broadcast sender are currently allocated
    pub fn is_warm(&self) -> bool {
        self.inner.state.lock().live.is_some()
    }

    /// Current cache plus a receiver positioned right after it, taken under
    /// one lock so nothing falls between the two. `None` once the hub is cold.
    fn resync(&self) -> Option<(Vec<PeerPresence>, broadcast::Receiver<PeerPresence>)> {
        let state = self.inner.state.lock();
        state
            .live
            .as_ref()
            .map(|live| (live.replay(), live.tx.subscribe()))
    }

    fn join(&self) -> (ObserverGuard, Vec<PeerPresence>, broadcast::Receiver<PeerPresence>) {
        let mut state = self.inner.state.lock();
        state.observers += 1;
        state.idle_generation += 1;

        let capacity = self.inner.capacity;
        let source = &self.inner.source;
        let live = state.live.get_or_insert_with(|| {
            let snapshot = source.borrow().clone();
            tracing::debug!("Presence hub warming up with {} entries", snapshot.len());
            let (tx, _) = broadcast::channel(capacity);
            Live {
                tx,
                cache: snapshot
                    .iter()
                    .map(|(peer, presence)| (peer.clone(), presence.clone()))
                    .collect(),
            }
        });

        let replay = live.replay();
        let rx = live.tx.subscribe();
        (ObserverGuard { hub: self.clone() }, replay, rx)
    }

    fn leave(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.observers = state.observers.saturating_sub(1);
            state.idle_generation += 1;
            if state.observers > 0 {
                return;
            }
            state.idle_generation
        };

        let grace = self.inner.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !grace.is_zero() => {
                let hub = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    hub.cool_down(generation);
                });
            }
            _ => self.cool_down(generation),
        }
    }

    fn cool_down(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.observers == 0 && state.idle_generation == generation && state.live.is_some() {
            state.live = None;
            tracing::debug!("Presence hub idle, released broadcast resources");
        }
    }
}

struct ObserverGuard {
    hub: PresenceHub,
}

fn note_shown(shown: &mut HashSet<PeerId>, presence: &PeerPresence) {
    if presence.status == PresenceStatus::Unknown {
        shown.remove(&presence.peer);
    } else {
        shown.insert(presence.peer.clone());
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.hub.leave();
    }
}
