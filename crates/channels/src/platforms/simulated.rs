// Simulated Liveness Channel
//
// In-process stand-in for a real liveness substrate. It reproduces the
// behavior the presence engine has to cope with: a subscribe is answered at
// once from a per-peer cache that may be arbitrarily stale, and a fresh
// "online" only follows after a probe delay if the peer is really reachable.
// Unreachable peers stay silent.

use crate::adapter::{ChannelError, LivenessChannel, PresenceSignal, SignalStream};
use async_trait::async_trait;
use peerwatch_core::{AccountId, PeerId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

const SIGNAL_BUFFER: usize = 256;
/// Oldest subscribe calls are dropped beyond this many
pub const CALL_LOG_LIMIT: usize = 1024;

/// One recorded subscribe/unsubscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCall {
    pub account: AccountId,
    pub peer: PeerId,
    pub enable: bool,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimPeer {
    reachable: bool,
    /// What the channel answers immediately on subscribe
    cached_online: Option<bool>,
    annotation: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    peers: HashMap<PeerId, SimPeer>,
    subscriptions: HashSet<(AccountId, PeerId)>,
    calls: VecDeque<SubscribeCall>,
    fail_subscribes: bool,
}

struct Inner {
    probe_delay: Duration,
    state: Mutex<SimState>,
    signal_tx: broadcast::Sender<PresenceSignal>,
}

/// Simulated channel handle (cheap to clone)
#[derive(Clone)]
pub struct SimulatedChannel {
    inner: Arc<Inner>,
}

impl SimulatedChannel {
    pub fn new(probe_delay: Duration) -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_BUFFER);
        Self {
            inner: Arc::new(Inner {
                probe_delay,
                state: Mutex::new(SimState::default()),
                signal_tx,
            }),
        }
    }

    /// Register a peer with its real reachability and an empty cache
    pub async fn add_peer(&self, peer: PeerId, reachable: bool) {
        let mut state = self.inner.state.lock().await;
        state.peers.insert(
            peer,
            SimPeer {
                reachable,
                ..SimPeer::default()
            },
        );
    }

    /// Overwrite the cached answer returned on subscribe
    pub async fn set_cached(&self, peer: &PeerId, cached_online: Option<bool>) {
        let mut state = self.inner.state.lock().await;
        state.peers.entry(peer.clone()).or_default().cached_online = cached_online;
    }

    pub async fn set_annotation(&self, peer: &PeerId, annotation: Option<String>) {
        let mut state = self.inner.state.lock().await;
        state.peers.entry(peer.clone()).or_default().annotation = annotation;
    }

    /// Change a peer's real reachability.
    ///
    /// With `announce` every subscriber receives the new state right away
    /// (graceful start/stop). Without it the peer changes silently, which is
    /// what an abrupt process death looks like: the cache keeps the old value.
    pub async fn set_reachable(&self, peer: &PeerId, reachable: bool, announce: bool) {
        let mut state = self.inner.state.lock().await;
        let annotation = {
            let entry = state.peers.entry(peer.clone()).or_default();
            entry.reachable = reachable;
            if announce {
                entry.cached_online = Some(reachable);
            }
            entry.annotation.clone()
        };

        if !announce {
            tracing::debug!("Simulated peer {} silently became reachable={}", peer, reachable);
            return;
        }

        let accounts: Vec<AccountId> = state
            .subscriptions
            .iter()
            .filter(|(_, p)| p == peer)
            .map(|(a, _)| a.clone())
            .collect();
        for account in accounts {
            self.emit(PresenceSignal {
                account,
                peer: peer.clone(),
                online: reachable,
                annotation: annotation.clone(),
            });
        }
    }

    /// Inject an arbitrary signal as if the network delivered it
    pub fn inject(&self, signal: PresenceSignal) {
        self.emit(signal);
    }

    /// Make every following subscribe/unsubscribe fail
    pub async fn fail_subscribes(&self, fail: bool) {
        self.inner.state.lock().await.fail_subscribes = fail;
    }

    pub async fn is_reachable(&self, peer: &PeerId) -> bool {
        let state = self.inner.state.lock().await;
        state.peers.get(peer).map(|p| p.reachable).unwrap_or(false)
    }

    pub async fn is_subscribed(&self, account: &AccountId, peer: &PeerId) -> bool {
        let state = self.inner.state.lock().await;
        state
            .subscriptions
            .contains(&(account.clone(), peer.clone()))
    }

    /// Recent subscribe calls (at most `CALL_LOG_LIMIT`), oldest first
    pub async fn calls(&self) -> Vec<SubscribeCall> {
        self.inner.state.lock().await.calls.iter().cloned().collect()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let state = self.inner.state.lock().await;
        let mut peers: Vec<PeerId> = state.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn emit(&self, signal: PresenceSignal) {
        tracing::trace!(
            "Simulated signal: account={} peer={} online={}",
            signal.account,
            signal.peer,
            signal.online
        );
        // No receivers just means nobody listens yet.
        let _ = self.inner.signal_tx.send(signal);
    }

    fn spawn_probe(&self, account: AccountId, peer: PeerId) {
        let channel = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(channel.inner.probe_delay).await;

            let mut state = channel.inner.state.lock().await;
            if !state
                .subscriptions
                .contains(&(account.clone(), peer.clone()))
            {
                return;
            }
            let Some(entry) = state.peers.get_mut(&peer) else {
                return;
            };
            if !entry.reachable {
                // Silence is the only answer from a dead peer.
                return;
            }
            entry.cached_online = Some(true);
            let annotation = entry.annotation.clone();
            drop(state);

            channel.emit(PresenceSignal {
                account,
                peer,
                online: true,
                annotation,
            });
        });
    }
}

#[async_trait]
impl LivenessChannel for SimulatedChannel {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn subscribe(
        &self,
        account: &AccountId,
        peer: &PeerId,
        enable: bool,
    ) -> Result<(), ChannelError> {
        let mut state = self.inner.state.lock().await;
        if state.calls.len() == CALL_LOG_LIMIT {
            state.calls.pop_front();
        }
        state.calls.push_back(SubscribeCall {
            account: account.clone(),
            peer: peer.clone(),
            enable,
            at: Instant::now(),
        });

        if state.fail_subscribes {
            return Err(ChannelError::SubscribeRejected {
                channel: self.name().to_string(),
                peer: peer.clone(),
                enable,
                reason: "injected failure".to_string(),
            });
        }

        let key = (account.clone(), peer.clone());
        if !enable {
            state.subscriptions.remove(&key);
            return Ok(());
        }

        state.subscriptions.insert(key);
        let echo = state
            .peers
            .get(peer)
            .and_then(|p| p.cached_online.map(|online| (online, p.annotation.clone())));
        drop(state);

        if let Some((online, annotation)) = echo {
            self.emit(PresenceSignal {
                account: account.clone(),
                peer: peer.clone(),
                online,
                annotation,
            });
        }
        self.spawn_probe(account.clone(), peer.clone());
        Ok(())
    }

    fn signals(&self) -> SignalStream {
        let mut rx = self.inner.signal_tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(signal) => yield signal,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Simulated signal stream lagged, {} signals dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn ids() -> (AccountId, PeerId) {
        (AccountId::from("acc"), PeerId::from("alice"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_echoes_stale_cache_immediately() {
        let channel = SimulatedChannel::new(Duration::from_secs(3));
        let (account, peer) = ids();
        channel.add_peer(peer.clone(), false).await;
        channel.set_cached(&peer, Some(true)).await;

        let mut signals = channel.signals();
        channel.subscribe(&account, &peer, true).await.unwrap();

        let echo = signals.next().await.unwrap();
        assert!(echo.online, "stale cache says online although peer is down");

        // The probe finds the peer unreachable and stays silent.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let next = tokio::time::timeout(Duration::from_millis(10), signals.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_reachable_peer() {
        let channel = SimulatedChannel::new(Duration::from_secs(3));
        let (account, peer) = ids();
        channel.add_peer(peer.clone(), true).await;

        let mut signals = channel.signals();
        channel.subscribe(&account, &peer, true).await.unwrap();

        let fresh = signals.next().await.unwrap();
        assert!(fresh.online);
        assert_eq!(fresh.account, account);
    }

    #[tokio::test]
    async fn test_announce_reaches_subscribers_only() {
        let channel = SimulatedChannel::new(Duration::from_secs(60));
        let (account, peer) = ids();
        channel.add_peer(peer.clone(), true).await;
        let mut signals = channel.signals();

        channel.set_reachable(&peer, false, true).await;
        channel.subscribe(&account, &peer, true).await.unwrap();
        // The announcement above only updated the cache; the echo carries it.
        let echo = signals.next().await.unwrap();
        assert!(!echo.online);

        channel.set_reachable(&peer, true, true).await;
        assert!(signals.next().await.unwrap().online);
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_log() {
        let channel = SimulatedChannel::new(Duration::from_secs(1));
        let (account, peer) = ids();
        channel.fail_subscribes(true).await;

        let err = channel.subscribe(&account, &peer, true).await.unwrap_err();
        assert!(matches!(err, ChannelError::SubscribeRejected { .. }));
        assert!(!channel.is_subscribed(&account, &peer).await);

        channel.fail_subscribes(false).await;
        channel.subscribe(&account, &peer, false).await.unwrap();
        let calls = channel.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].enable);
        assert!(!calls[1].enable);
    }

    #[tokio::test]
    async fn test_call_log_is_bounded() {
        let channel = SimulatedChannel::new(Duration::from_secs(1));
        let (account, peer) = ids();
        for _ in 0..CALL_LOG_LIMIT + 10 {
            channel.subscribe(&account, &peer, false).await.unwrap();
        }
        channel.subscribe(&account, &peer, true).await.unwrap();

        let calls = channel.calls().await;
        assert_eq!(calls.len(), CALL_LOG_LIMIT);
        assert!(calls.last().unwrap().enable);
    }
}
