// Engine actor messages
//
// Everything that may mutate presence state travels through this queue so the
// actor stays the only writer.

use peerwatch_channels::PresenceSignal;
use peerwatch_core::{AccountId, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type WeakCommandSender = mpsc::WeakUnboundedSender<Command>;
pub(crate) type Ack = oneshot::Sender<()>;

#[derive(Debug)]
pub(crate) enum Command {
    /// Inbound channel signal, stamped on arrival
    Signal {
        signal: PresenceSignal,
        observed_at: Instant,
    },
    SetAccount {
        account: Option<AccountId>,
        ack: Ack,
    },
    Track {
        peer: PeerId,
        ack: Ack,
    },
    Untrack {
        peer: PeerId,
        ack: Ack,
    },
    Refresh {
        peer: PeerId,
        ack: Ack,
    },
    /// Interest lease taken by a per-peer observer
    Acquire {
        lease: u64,
        peer: PeerId,
    },
    Release {
        lease: u64,
    },
    ReleaseExpired {
        peer: PeerId,
        seq: u64,
    },
    /// Poller candidates: peers that looked online in the last snapshot
    Poll {
        peers: Vec<PeerId>,
    },
    /// Earlier calls for the peer finished; record the timestamp and subscribe.
    /// `after` is the queued call that sent it.
    Resubscribe {
        peer: PeerId,
        epoch: u64,
        after: u64,
    },
    /// Reaper candidate, applied only if `confirmed_at` is still current
    Expire {
        peer: PeerId,
        confirmed_at: Instant,
    },
    Shutdown {
        ack: Ack,
    },
}
