// Presence Engine
//
// `PresenceEngine` is the cheap, cloneable handle consumers and lifecycle
// code talk to. All state lives in `EngineActor`, a single task that owns the
// store and the subscription tracker and processes one command at a time.
// The signal pump, poller and reaper only enqueue commands.

use crate::broadcast::{PresenceHub, PresenceStream};
use crate::command::{Ack, Command, CommandSender, WeakCommandSender};
use crate::filter::IngestFilter;
use crate::poller::spawn_poller;
use crate::reaper::spawn_reaper;
use crate::store::{Snapshot, StateStore};
use crate::tracker::SubscriptionTracker;
use crate::types::{PeerPresence, RawSignal};
use futures_util::StreamExt;
use peerwatch_channels::{LivenessChannel, PresenceSignal, SignalStream};
use peerwatch_core::{AccountId, ConfigValidator, PeerId, PeerwatchError, PresenceConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Handle to a running presence engine
#[derive(Clone)]
pub struct PresenceEngine {
    commands: CommandSender,
    snapshot: watch::Receiver<Snapshot>,
    hub: PresenceHub,
    next_lease: Arc<AtomicU64>,
}

impl PresenceEngine {
    /// Validate `config` and spawn the engine on the current tokio runtime.
    ///
    /// The engine starts suspended; call [`set_account`](Self::set_account)
    /// to begin tracking.
    pub fn start(
        config: PresenceConfig,
        channel: Arc<dyn LivenessChannel>,
    ) -> Result<Self, PeerwatchError> {
        ConfigValidator::validate_presence(&config)?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let store = StateStore::new(config.broadcast_capacity, config.observer_grace());
        let snapshot = store.snapshot_receiver();
        let hub = store.hub();

        // Subscribe to signals before any subscribe call can produce one.
        let signal_pump = spawn_signal_pump(channel.signals(), &commands);
        tracing::info!("Presence engine started on channel '{}'", channel.name());

        let actor = EngineActor {
            filter: IngestFilter::new(config.suppress_window()),
            config,
            channel,
            receiver,
            commands: commands.downgrade(),
            tracker: SubscriptionTracker::new(),
            store,
            scope: None,
            epoch: 0,
            pinned: HashSet::new(),
            leases: HashMap::new(),
            pending_release: HashMap::new(),
            release_seq: 0,
            calls: HashMap::new(),
            call_seq: 0,
            signal_pump,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands,
            snapshot,
            hub,
            next_lease: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Switch the active account. Clears all presence state; `None` suspends
    /// polling and reaping until an account becomes active again.
    pub async fn set_account(&self, account: Option<AccountId>) -> Result<(), PeerwatchError> {
        self.request("set account", |ack| Command::SetAccount { account, ack })
            .await
    }

    /// Track a contact. Pinned until [`untrack`](Self::untrack).
    pub async fn track(&self, peer: PeerId) -> Result<(), PeerwatchError> {
        self.request("track peer", |ack| Command::Track { peer, ack })
            .await
    }

    pub async fn track_all(
        &self,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> Result<(), PeerwatchError> {
        for peer in peers {
            self.track(peer).await?;
        }
        Ok(())
    }

    pub async fn untrack(&self, peer: PeerId) -> Result<(), PeerwatchError> {
        self.request("untrack peer", |ack| Command::Untrack { peer, ack })
            .await
    }

    /// Force a fresh report for one tracked peer, whatever its status.
    pub async fn refresh(&self, peer: PeerId) -> Result<(), PeerwatchError> {
        self.request("refresh peer", |ack| Command::Refresh { peer, ack })
            .await
    }

    /// Stop periodic tasks and clear all state.
    pub async fn shutdown(&self) -> Result<(), PeerwatchError> {
        self.request("shut down", |ack| Command::Shutdown { ack })
            .await
    }

    /// Current presence of `peer`; unknown when the peer is not tracked.
    pub fn snapshot(&self, peer: &PeerId) -> PeerPresence {
        self.snapshot
            .borrow()
            .get(peer)
            .cloned()
            .unwrap_or_else(|| PeerPresence::unknown(peer.clone()))
    }

    pub fn snapshot_all(&self) -> Vec<PeerPresence> {
        let mut entries: Vec<PeerPresence> = self.snapshot.borrow().values().cloned().collect();
        entries.sort_by(|a, b| a.peer.cmp(&b.peer));
        entries
    }

    /// Every tracked peer, current values first, then each visible change.
    pub fn observe(&self) -> PresenceStream {
        self.hub.observe()
    }

    /// Updates for a single peer. While the stream is alive the peer stays
    /// tracked; a peer tracked only this way is released once the last such
    /// stream has been dropped for the observer grace period.
    pub fn observe_peer(&self, peer: PeerId) -> PresenceStream {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let guard = InterestLease {
            lease,
            commands: self.commands.clone(),
        };
        // Register interest before attaching so the peer's entry is replayed
        // or published to this observer.
        let _ = self.commands.send(Command::Acquire {
            lease,
            peer: peer.clone(),
        });

        let mut updates = self.hub.observe();
        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(presence) = updates.next().await {
                if presence.peer == peer {
                    yield presence;
                }
            }
        };
        Box::pin(stream)
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observer_count()
    }

    async fn request(
        &self,
        operation: &str,
        make: impl FnOnce(Ack) -> Command,
    ) -> Result<(), PeerwatchError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(make(ack))
            .map_err(|_| PeerwatchError::engine_stopped(operation))?;
        done.await
            .map_err(|_| PeerwatchError::engine_stopped(operation))
    }
}

struct InterestLease {
    lease: u64,
    commands: CommandSender,
}

impl Drop for InterestLease {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release { lease: self.lease });
    }
}

fn spawn_signal_pump(mut signals: SignalStream, commands: &CommandSender) -> JoinHandle<()> {
    let commands = commands.downgrade();
    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            let observed_at = Instant::now();
            let Some(tx) = commands.upgrade() else {
                break;
            };
            if tx.send(Command::Signal { signal, observed_at }).is_err() {
                break;
            }
        }
        tracing::debug!("Signal pump stopped");
    })
}

/// Active account plus the periodic tasks bound to it
struct Scope {
    account: AccountId,
    poller: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl Scope {
    fn cancel(&self) {
        self.poller.abort();
        self.reaper.abort();
    }
}

struct EngineActor {
    config: PresenceConfig,
    channel: Arc<dyn LivenessChannel>,
    filter: IngestFilter,
    receiver: mpsc::UnboundedReceiver<Command>,
    /// Weak so the actor never keeps itself alive
    commands: WeakCommandSender,
    tracker: SubscriptionTracker,
    store: StateStore,
    scope: Option<Scope>,
    /// Bumped on every scope change; late adapter completions carry the old value
    epoch: u64,
    pinned: HashSet<PeerId>,
    leases: HashMap<u64, PeerId>,
    pending_release: HashMap<PeerId, u64>,
    release_seq: u64,
    /// Last adapter call queued per peer; each new call waits for it
    calls: HashMap<PeerId, QueuedCall>,
    call_seq: u64,
    signal_pump: JoinHandle<()>,
}

struct QueuedCall {
    seq: u64,
    task: JoinHandle<()>,
}

impl EngineActor {
    async fn run(mut self) {
        // Ends on shutdown or once every public handle has been dropped.
        while let Some(command) = self.receiver.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        self.teardown();
        tracing::info!("Presence engine stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Signal {
                signal,
                observed_at,
            } => self.on_signal(signal, observed_at),
            Command::SetAccount { account, ack } => {
                self.set_account(account);
                let _ = ack.send(());
            }
            Command::Track { peer, ack } => {
                if self.scope.is_some() {
                    self.pinned.insert(peer.clone());
                    self.ensure_tracked(&peer);
                } else {
                    tracing::debug!("No active account, not tracking {}", peer);
                }
                let _ = ack.send(());
            }
            Command::Untrack { peer, ack } => {
                self.pinned.remove(&peer);
                if !self.has_interest(&peer) {
                    self.drop_peer(&peer);
                }
                let _ = ack.send(());
            }
            Command::Refresh { peer, ack } => {
                if self.store.contains(&peer) {
                    self.begin_resubscribe(&peer);
                }
                let _ = ack.send(());
            }
            Command::Acquire { lease, peer } => {
                if self.scope.is_some() {
                    self.pending_release.remove(&peer);
                    self.leases.insert(lease, peer.clone());
                    self.ensure_tracked(&peer);
                }
            }
            Command::Release { lease } => self.on_release(lease),
            Command::ReleaseExpired { peer, seq } => {
                if self.pending_release.get(&peer) == Some(&seq) {
                    self.pending_release.remove(&peer);
                    if !self.pinned.contains(&peer) && !self.has_interest(&peer) {
                        tracing::debug!("No observer left for {}, releasing", peer);
                        self.drop_peer(&peer);
                    }
                }
            }
            Command::Poll { peers } => {
                for peer in peers {
                    // The poller read a snapshot; only act on what is still true.
                    if self.store.get(&peer).is_some_and(PeerPresence::is_online) {
                        self.begin_resubscribe(&peer);
                    }
                }
            }
            Command::Resubscribe { peer, epoch, after } => {
                // Anything queued since `after` carries its own follow-up.
                let superseded = self.calls.get(&peer).is_some_and(|c| c.seq != after);
                if epoch == self.epoch && !superseded && self.store.contains(&peer) {
                    self.issue_subscribe(&peer);
                }
            }
            Command::Expire { peer, confirmed_at } => self.on_expire(peer, confirmed_at),
            Command::Shutdown { ack } => {
                self.teardown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn on_signal(&mut self, signal: PresenceSignal, observed_at: Instant) {
        match &self.scope {
            Some(scope) if scope.account == signal.account => {}
            _ => {
                tracing::debug!(
                    "Dropping signal for {} from inactive account {}",
                    signal.peer,
                    signal.account
                );
                return;
            }
        }
        if !self.store.contains(&signal.peer) {
            tracing::debug!("Dropping signal for untracked peer {}", signal.peer);
            return;
        }

        let raw = RawSignal {
            peer: signal.peer,
            reported_online: signal.online,
            observed_at,
            annotation: signal.annotation,
        };
        self.filter.accept(&self.tracker, &mut self.store, raw);
    }

    fn on_expire(&mut self, peer: PeerId, confirmed_at: Instant) {
        let Some(entry) = self.store.get(&peer) else {
            return;
        };
        if !entry.is_online() || entry.last_confirmed_at != Some(confirmed_at) {
            // Confirmed again since the reaper looked.
            return;
        }
        let silent_for = Instant::now().saturating_duration_since(confirmed_at);
        if silent_for <= self.config.timeout_window() {
            return;
        }
        if self.store.expire(&peer) {
            tracing::info!(
                "Peer {} unconfirmed for {:?}, marking offline",
                peer,
                silent_for
            );
        }
    }

    fn on_release(&mut self, lease: u64) {
        let Some(peer) = self.leases.remove(&lease) else {
            return;
        };
        if self.pinned.contains(&peer) || self.has_interest(&peer) {
            return;
        }

        self.release_seq += 1;
        let seq = self.release_seq;
        self.pending_release.insert(peer.clone(), seq);

        let grace = self.config.observer_grace();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReleaseExpired { peer, seq });
            }
        });
    }

    fn set_account(&mut self, account: Option<AccountId>) {
        let current = self.scope.as_ref().map(|s| &s.account);
        if current == account.as_ref() {
            tracing::debug!("Account scope unchanged");
            return;
        }

        self.clear_scope();

        match account {
            Some(account) => {
                let snapshot = self.store.snapshot_receiver();
                let poller = spawn_poller(
                    self.config.poll_interval(),
                    snapshot.clone(),
                    self.commands.clone(),
                );
                let reaper = spawn_reaper(
                    self.config.check_interval(),
                    self.config.timeout_window(),
                    snapshot,
                    self.commands.clone(),
                );
                tracing::info!("Presence tracking active for account {}", account);
                self.scope = Some(Scope {
                    account,
                    poller,
                    reaper,
                });
            }
            None => tracing::info!("No active account, presence tracking suspended"),
        }
    }

    /// Cancel periodic tasks, unsubscribe everything and reset state.
    fn clear_scope(&mut self) {
        self.epoch += 1;
        if let Some(scope) = self.scope.take() {
            scope.cancel();
            for peer in self.store.peers() {
                self.queue_call(scope.account.clone(), peer, false);
            }
            tracing::info!("Cleared presence state of account {}", scope.account);
        }
        self.store.reset();
        self.tracker.clear();
        self.pinned.clear();
        self.leases.clear();
        self.pending_release.clear();
    }

    fn teardown(&mut self) {
        self.clear_scope();
        self.signal_pump.abort();
    }

    fn has_interest(&self, peer: &PeerId) -> bool {
        self.leases.values().any(|p| p == peer)
    }

    fn ensure_tracked(&mut self, peer: &PeerId) {
        if self.store.track(peer) {
            tracing::debug!("Tracking {}", peer);
            self.subscribe_now(peer);
        }
    }

    fn drop_peer(&mut self, peer: &PeerId) {
        if self.store.untrack(peer).is_none() {
            return;
        }
        self.tracker.forget(peer);
        if let Some(account) = self.scope.as_ref().map(|s| s.account.clone()) {
            self.queue_call(account, peer.clone(), false);
        }
        tracing::debug!("Stopped tracking {}", peer);
    }

    /// Record the subscribe timestamp, then issue the subscribe. The
    /// timestamp must be in place before any echo can be ingested, so while
    /// another call for the peer is still running the subscribe is deferred
    /// until that call has finished.
    fn subscribe_now(&mut self, peer: &PeerId) {
        if self.scope.is_none() {
            return;
        }
        if self.call_pending(peer) {
            self.subscribe_after_pending(peer);
        } else {
            self.issue_subscribe(peer);
        }
    }

    fn issue_subscribe(&mut self, peer: &PeerId) {
        let Some(account) = self.scope.as_ref().map(|s| s.account.clone()) else {
            return;
        };
        let now = Instant::now();
        self.tracker.record_subscribe(peer, now);
        self.store.note_subscribe(peer, now);
        self.queue_call(account, peer.clone(), true);
    }

    /// Unsubscribe, then come back through the queue to resubscribe.
    fn begin_resubscribe(&mut self, peer: &PeerId) {
        let Some(account) = self.scope.as_ref().map(|s| s.account.clone()) else {
            return;
        };
        self.queue_call(account, peer.clone(), false);
        self.subscribe_after_pending(peer);
    }

    fn call_pending(&self, peer: &PeerId) -> bool {
        self.calls
            .get(peer)
            .is_some_and(|call| !call.task.is_finished())
    }

    /// Wait for the peer's queued calls, then send `Resubscribe`.
    fn subscribe_after_pending(&mut self, peer: &PeerId) {
        let previous = self.calls.remove(peer).map(|call| call.task);
        let commands = self.commands.clone();
        let epoch = self.epoch;
        let after = self.next_call_seq();
        let waiting = peer.clone();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Resubscribe {
                    peer: waiting,
                    epoch,
                    after,
                });
            }
        });
        self.calls.insert(peer.clone(), QueuedCall { seq: after, task });
    }

    /// Issue one adapter call for `peer` after every call queued before it.
    fn queue_call(&mut self, account: AccountId, peer: PeerId, enable: bool) {
        self.calls.retain(|_, call| !call.task.is_finished());

        let previous = self.calls.remove(&peer).map(|call| call.task);
        let channel = self.channel.clone();
        let seq = self.next_call_seq();
        let target = peer.clone();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = channel.subscribe(&account, &target, enable).await {
                tracing::warn!("Channel subscribe({}) for {} failed: {}", enable, target, e);
            }
        });
        self.calls.insert(peer, QueuedCall { seq, task });
    }

    fn next_call_seq(&mut self) -> u64 {
        self.call_seq += 1;
        self.call_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwatch_channels::SimulatedChannel;
    use std::time::Duration;

    async fn running(peer: &PeerId) -> (SimulatedChannel, PresenceEngine) {
        let channel = SimulatedChannel::new(Duration::from_secs(3));
        channel.add_peer(peer.clone(), true).await;
        let engine =
            PresenceEngine::start(PresenceConfig::default(), Arc::new(channel.clone())).unwrap();
        engine.set_account(Some(AccountId::from("acc"))).await.unwrap();
        engine.track(peer.clone()).await.unwrap();
        (channel, engine)
    }

    /// Round trip through the actor so earlier commands have been handled.
    async fn settle(engine: &PresenceEngine) {
        engine.set_account(Some(AccountId::from("acc"))).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_with_outdated_confirmation_is_ignored() {
        let bob = PeerId::from("bob");
        let (_channel, engine) = running(&bob).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        let first = engine.snapshot(&bob).last_confirmed_at.unwrap();

        // The 60s poll confirms again at 63s; by 95s the first
        // confirmation alone would be past the timeout.
        tokio::time::sleep(Duration::from_secs(91)).await;
        let latest = engine.snapshot(&bob).last_confirmed_at.unwrap();
        assert!(latest > first);

        engine
            .commands
            .send(Command::Expire {
                peer: bob.clone(),
                confirmed_at: first,
            })
            .unwrap();
        settle(&engine).await;
        assert!(engine.snapshot(&bob).is_online());

        // Current confirmation, but not silent for long enough yet.
        engine
            .commands
            .send(Command::Expire {
                peer: bob.clone(),
                confirmed_at: latest,
            })
            .unwrap();
        settle(&engine).await;
        assert!(engine.snapshot(&bob).is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_applies_after_real_silence() {
        let bob = PeerId::from("bob");
        let (channel, engine) = running(&bob).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        channel.set_reachable(&bob, false, false).await;

        let confirmed = engine.snapshot(&bob).last_confirmed_at.unwrap();
        tokio::time::sleep(Duration::from_secs(91)).await;
        engine
            .commands
            .send(Command::Expire {
                peer: bob.clone(),
                confirmed_at: confirmed,
            })
            .unwrap();
        settle(&engine).await;
        assert_eq!(engine.snapshot(&bob).status, crate::types::PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_resubscribe_is_ignored() {
        let bob = PeerId::from("bob");
        let (channel, engine) = running(&bob).await;
        settle(&engine).await;
        let before = channel.calls().await.len();

        engine
            .commands
            .send(Command::Resubscribe {
                peer: bob.clone(),
                epoch: 0,
                after: 0,
            })
            .unwrap();
        settle(&engine).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.calls().await.len(), before);
    }
}
