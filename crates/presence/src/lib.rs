// Peerwatch Presence Engine
//
// Turns a noisy, cache-prone liveness channel into a stable online/offline
// view per peer and fans it out to any number of observers.

pub mod broadcast;
mod command;
pub mod engine;
pub mod filter;
pub mod poller;
pub mod reaper;
pub mod store;
pub mod tracker;
pub mod types;

pub use broadcast::{PresenceHub, PresenceStream};
pub use engine::PresenceEngine;
pub use filter::IngestFilter;
pub use store::{Snapshot, StateStore};
pub use tracker::SubscriptionTracker;
pub use types::{Decision, PeerPresence, PresenceStatus, RawSignal};
