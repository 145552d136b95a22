// Presence data model

use peerwatch_core::PeerId;
use std::fmt;
use tokio::time::Instant;

/// Reachability of a tracked peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresenceStatus {
    /// No trustworthy signal seen yet (or the peer is no longer tracked)
    #[default]
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Current presence of one peer.
///
/// Timestamps come from the engine's monotonic clock and are never
/// compared with wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub peer: PeerId,
    pub status: PresenceStatus,
    /// Last signal accepted as trustworthy
    pub last_confirmed_at: Option<Instant>,
    /// Last subscribe request issued for this peer
    pub last_subscribe_at: Option<Instant>,
    /// Optional free-text note carried by the last accepted signal
    pub annotation: Option<String>,
}

impl PeerPresence {
    pub fn unknown(peer: PeerId) -> Self {
        Self {
            peer,
            status: PresenceStatus::Unknown,
            last_confirmed_at: None,
            last_subscribe_at: None,
            annotation: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }

    /// Equality on what observers can see; timestamps are bookkeeping.
    pub fn same_visible_state(&self, other: &PeerPresence) -> bool {
        self.peer == other.peer && self.status == other.status && self.annotation == other.annotation
    }
}

/// A signal stamped on arrival, consumed once by the ingest filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignal {
    pub peer: PeerId,
    pub reported_online: bool,
    pub observed_at: Instant,
    pub annotation: Option<String>,
}

impl RawSignal {
    pub fn new(peer: PeerId, reported_online: bool, observed_at: Instant) -> Self {
        Self {
            peer,
            reported_online,
            observed_at,
            annotation: None,
        }
    }
}

/// Ingest filter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    /// Treated as a cache echo of our own subscribe call
    Suppressed,
}
