// Liveness Channel Adapter Interface
//
// Defines the contract every liveness substrate (local discovery, wide-area
// routing, simulator) must satisfy for the presence engine.

use async_trait::async_trait;
use futures_util::stream::Stream;
use peerwatch_core::{AccountId, PeerId};
use std::pin::Pin;
use thiserror::Error;

/// Inbound reachability report, exactly as the channel delivered it.
///
/// `online == true` may be a cached historical value rather than a fresh
/// observation; the channel gives no way to tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSignal {
    pub account: AccountId,
    pub peer: PeerId,
    pub online: bool,
    pub annotation: Option<String>,
}

impl PresenceSignal {
    pub fn new(account: AccountId, peer: PeerId, online: bool) -> Self {
        Self {
            account,
            peer,
            online,
            annotation: None,
        }
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

/// Boxed stream of inbound signals
pub type SignalStream = Pin<Box<dyn Stream<Item = PresenceSignal> + Send>>;

/// Unified liveness channel trait
#[async_trait]
pub trait LivenessChannel: Send + Sync {
    /// Substrate name (e.g., "simulated", "dht")
    fn name(&self) -> &str;

    /// Enable or disable presence reports for one peer.
    ///
    /// Fire-and-forget from the channel's point of view: success only means the
    /// request was handed over, not that any signal will follow.
    async fn subscribe(
        &self,
        account: &AccountId,
        peer: &PeerId,
        enable: bool,
    ) -> Result<(), ChannelError>;

    /// Inbound signal stream. Ordering is preserved per peer only.
    fn signals(&self) -> SignalStream;
}

/// Channel error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("subscribe({enable}) for {peer} rejected by {channel}: {reason}")]
    SubscribeRejected {
        channel: String,
        peer: PeerId,
        enable: bool,
        reason: String,
    },
}
