pub mod config;
pub mod error;
pub mod ids;

// Re-export commonly used types
pub use config::{AccountConfig, Config, ConfigLoader, ConfigValidator, PresenceConfig, SimulatorConfig};
pub use error::{DomainError, InfraError, PeerwatchError};
pub use ids::{AccountId, PeerId};
