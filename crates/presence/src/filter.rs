// Ingest Filter
//
// Decides which raw signals may touch the store. A subscribe call makes the
// channel answer straight from its cache, and that answer looks exactly like
// a fresh report. The only discriminant is timing: an "online" arriving within
// `suppress_window` of our own subscribe is treated as that cache echo.
// "Offline" is never suppressed.

use crate::store::StateStore;
use crate::tracker::SubscriptionTracker;
use crate::types::{Decision, RawSignal};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct IngestFilter {
    suppress_window: Duration,
}

impl IngestFilter {
    pub fn new(suppress_window: Duration) -> Self {
        Self { suppress_window }
    }

    pub fn suppress_window(&self) -> Duration {
        self.suppress_window
    }

    /// Classify without side effects
    pub fn classify(&self, tracker: &SubscriptionTracker, signal: &RawSignal) -> Decision {
        if !signal.reported_online {
            return Decision::Accepted;
        }
        let elapsed = tracker.time_since_subscribe(&signal.peer, signal.observed_at);
        if elapsed < self.suppress_window {
            Decision::Suppressed
        } else {
            Decision::Accepted
        }
    }

    /// Classify and, if accepted, apply the signal to the store.
    pub fn accept(
        &self,
        tracker: &SubscriptionTracker,
        store: &mut StateStore,
        signal: RawSignal,
    ) -> Decision {
        let decision = self.classify(tracker, &signal);
        match decision {
            Decision::Suppressed => {
                tracing::debug!(
                    "Suppressed cache echo for {} ({:?} after subscribe)",
                    signal.peer,
                    tracker.time_since_subscribe(&signal.peer, signal.observed_at)
                );
            }
            Decision::Accepted => {
                let changed = store.apply_signal(
                    &signal.peer,
                    signal.reported_online,
                    signal.observed_at,
                    signal.annotation,
                );
                if changed {
                    tracing::info!(
                        "Peer {} is now {}",
                        signal.peer,
                        if signal.reported_online { "online" } else { "offline" }
                    );
                }
            }
        }
        decision
    }
}
