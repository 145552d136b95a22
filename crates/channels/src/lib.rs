// Liveness Channel Adapters
//
// This crate defines the boundary to the push-style liveness channel and ships
// an in-process simulated channel used by the CLI and the engine tests.

pub mod adapter;
pub mod platforms;

pub use adapter::{ChannelError, LivenessChannel, PresenceSignal, SignalStream};
pub use platforms::simulated::{SimulatedChannel, SubscribeCall};
