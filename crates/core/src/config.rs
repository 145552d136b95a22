//! Peerwatch Configuration
//!
//! Configuration structures with serde defaults for every field, a loader that
//! resolves the config file location, and a validator for interval constraints.

use crate::error::PeerwatchError;
use crate::ids::{AccountId, PeerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default interval between active refreshes of online peers (ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
/// Default interval between timeout sweeps (ms)
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 10_000;
/// Default silence after which an online peer is demoted (ms)
pub const DEFAULT_TIMEOUT_WINDOW_MS: u64 = 90_000;
/// Default window after a subscribe during which "online" is treated as a cache echo (ms)
pub const DEFAULT_SUPPRESS_WINDOW_MS: u64 = 2_000;
/// Default time the fan-out stays warm after the last observer leaves (ms)
pub const DEFAULT_OBSERVER_GRACE_MS: u64 = 5_000;
/// Default capacity of the observer broadcast buffer
pub const DEFAULT_BROADCAST_CAPACITY: usize = 100;
/// Upper bound for every configured interval (ms): one day
pub const MAX_INTERVAL_MS: u64 = 86_400_000;
/// Default delay before the simulator answers a subscribe with a fresh probe (ms)
pub const DEFAULT_PROBE_DELAY_MS: u64 = 3_000;
/// Default interval between random reachability flips in the simulator (ms)
pub const DEFAULT_FLIP_INTERVAL_MS: u64 = 20_000;

// ============================================================================
// Helper functions for paths
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_peerwatch_dir() -> PathBuf {
    home_dir().join(".peerwatch")
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active account and its persisted contact list
    #[serde(default)]
    pub account: AccountConfig,
    /// Presence engine timing
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Simulated liveness channel used by `peerwatch simulate`
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

// ============================================================================
// Account Config
// ============================================================================

/// Account scope loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account to activate on startup; `None` starts suspended
    #[serde(default)]
    pub id: Option<AccountId>,
    /// Contacts tracked as soon as the account is active
    #[serde(default)]
    pub contacts: Vec<PeerId>,
}

// ============================================================================
// Presence Config
// ============================================================================

/// Presence engine timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Active refresh interval for online peers
    #[serde(default = "PresenceConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout sweep interval
    #[serde(default = "PresenceConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Silence tolerated before an online peer is demoted
    #[serde(default = "PresenceConfig::default_timeout_window_ms")]
    pub timeout_window_ms: u64,
    /// Heuristic cache-echo window after a subscribe. Not a proven bound: the
    /// channel gives no freshness indication, so keep this tunable.
    #[serde(default = "PresenceConfig::default_suppress_window_ms")]
    pub suppress_window_ms: u64,
    /// Grace period before idle observers/leases release their resources
    #[serde(default = "PresenceConfig::default_observer_grace_ms")]
    pub observer_grace_ms: u64,
    /// Observer broadcast buffer size
    #[serde(default = "PresenceConfig::default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl PresenceConfig {
    fn default_poll_interval_ms() -> u64 {
        DEFAULT_POLL_INTERVAL_MS
    }
    fn default_check_interval_ms() -> u64 {
        DEFAULT_CHECK_INTERVAL_MS
    }
    fn default_timeout_window_ms() -> u64 {
        DEFAULT_TIMEOUT_WINDOW_MS
    }
    fn default_suppress_window_ms() -> u64 {
        DEFAULT_SUPPRESS_WINDOW_MS
    }
    fn default_observer_grace_ms() -> u64 {
        DEFAULT_OBSERVER_GRACE_MS
    }
    fn default_broadcast_capacity() -> usize {
        DEFAULT_BROADCAST_CAPACITY
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout_window(&self) -> Duration {
        Duration::from_millis(self.timeout_window_ms)
    }

    pub fn suppress_window(&self) -> Duration {
        Duration::from_millis(self.suppress_window_ms)
    }

    pub fn observer_grace(&self) -> Duration {
        Duration::from_millis(self.observer_grace_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            timeout_window_ms: DEFAULT_TIMEOUT_WINDOW_MS,
            suppress_window_ms: DEFAULT_SUPPRESS_WINDOW_MS,
            observer_grace_ms: DEFAULT_OBSERVER_GRACE_MS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

// ============================================================================
// Simulator Config
// ============================================================================

/// Simulated liveness channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Delay between a subscribe and the fresh probe answer
    #[serde(default = "SimulatorConfig::default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    /// Interval between random reachability flips
    #[serde(default = "SimulatorConfig::default_flip_interval_ms")]
    pub flip_interval_ms: u64,
    /// RNG seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SimulatorConfig {
    fn default_probe_delay_ms() -> u64 {
        DEFAULT_PROBE_DELAY_MS
    }
    fn default_flip_interval_ms() -> u64 {
        DEFAULT_FLIP_INTERVAL_MS
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn flip_interval(&self) -> Duration {
        Duration::from_millis(self.flip_interval_ms)
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            probe_delay_ms: DEFAULT_PROBE_DELAY_MS,
            flip_interval_ms: DEFAULT_FLIP_INTERVAL_MS,
            seed: None,
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&str>) -> Result<Config, PeerwatchError> {
        let config_path = Self::resolve_config_path(path)?;
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| PeerwatchError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| PeerwatchError::config_parse_error(format!("Failed to parse: {}", e)))?;
        tracing::debug!("Loaded configuration from {:?}", config_path);
        Ok(config)
    }

    /// Resolve configuration file path
    fn resolve_config_path(path: Option<&str>) -> Result<PathBuf, PeerwatchError> {
        if let Some(p) = path {
            let p = PathBuf::from(p);
            if !p.exists() {
                return Err(PeerwatchError::config_not_found(p.display().to_string()));
            }
            return Ok(p);
        }

        let default_paths = [
            default_peerwatch_dir().join("config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("peerwatch.yaml"),
            PathBuf::from("./peerwatch.yaml"),
        ];

        default_paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                PeerwatchError::config_not_found(
                    "Config not found. Run `peerwatch config-sample` or create ~/.peerwatch/config.yaml",
                )
            })
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration
    pub fn validate(config: &Config) -> Result<(), PeerwatchError> {
        Self::validate_presence(&config.presence)?;

        let simulator = [
            ("simulator.probe_delay_ms", config.simulator.probe_delay_ms),
            ("simulator.flip_interval_ms", config.simulator.flip_interval_ms),
        ];
        for (field, value) in simulator {
            if value == 0 || value > MAX_INTERVAL_MS {
                return Err(PeerwatchError::config_invalid(
                    field,
                    format!("must be between 1 and {}ms", MAX_INTERVAL_MS),
                ));
            }
        }

        Ok(())
    }

    /// Validate the presence timing constraints on their own
    pub fn validate_presence(presence: &PresenceConfig) -> Result<(), PeerwatchError> {
        let non_zero = [
            ("presence.poll_interval_ms", presence.poll_interval_ms),
            ("presence.check_interval_ms", presence.check_interval_ms),
            ("presence.timeout_window_ms", presence.timeout_window_ms),
            ("presence.suppress_window_ms", presence.suppress_window_ms),
            (
                "presence.broadcast_capacity",
                presence.broadcast_capacity as u64,
            ),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(PeerwatchError::config_invalid(
                    field,
                    "must be greater than zero",
                ));
            }
        }

        let bounded = [
            ("presence.poll_interval_ms", presence.poll_interval_ms),
            ("presence.check_interval_ms", presence.check_interval_ms),
            ("presence.timeout_window_ms", presence.timeout_window_ms),
            ("presence.suppress_window_ms", presence.suppress_window_ms),
            ("presence.observer_grace_ms", presence.observer_grace_ms),
        ];
        for (field, value) in bounded {
            if value > MAX_INTERVAL_MS {
                return Err(PeerwatchError::config_invalid(
                    field,
                    format!("must not exceed {}ms", MAX_INTERVAL_MS),
                ));
            }
        }

        // The reaper would otherwise demote peers the poller never had a chance to refresh.
        if presence.poll_interval_ms >= presence.timeout_window_ms {
            return Err(PeerwatchError::config_invalid(
                "presence.poll_interval_ms",
                format!(
                    "poll interval ({}ms) must be strictly less than timeout window ({}ms)",
                    presence.poll_interval_ms, presence.timeout_window_ms
                ),
            ));
        }

        if presence.suppress_window_ms >= presence.poll_interval_ms {
            return Err(PeerwatchError::config_invalid(
                "presence.suppress_window_ms",
                format!(
                    "suppress window ({}ms) must be less than poll interval ({}ms)",
                    presence.suppress_window_ms, presence.poll_interval_ms
                ),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Config Implementation
// ============================================================================

impl Config {
    /// Load configuration and validate it
    pub fn load(path: &Option<String>) -> Result<Self, PeerwatchError> {
        let config = ConfigLoader::load(path.as_deref())?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), PeerwatchError> {
        let content = serde_yml::to_string(self).map_err(|e| {
            PeerwatchError::config_parse_error(format!("Serialization failed: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            account: AccountConfig {
                id: Some(AccountId::new("local-account")),
                contacts: vec![
                    PeerId::new("alice"),
                    PeerId::new("bob"),
                    PeerId::new("carol"),
                ],
            },
            presence: PresenceConfig::default(),
            simulator: SimulatorConfig {
                seed: Some(7),
                ..SimulatorConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let presence = PresenceConfig::default();
        assert_eq!(presence.poll_interval(), Duration::from_secs(60));
        assert_eq!(presence.check_interval(), Duration::from_secs(10));
        assert_eq!(presence.timeout_window(), Duration::from_secs(90));
        assert_eq!(presence.suppress_window(), Duration::from_secs(2));
        assert_eq!(presence.observer_grace(), Duration::from_secs(5));
        assert!(ConfigValidator::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.presence, PresenceConfig::default());
        assert!(config.account.id.is_none());
        assert!(config.account.contacts.is_empty());
    }

    #[test]
    fn test_partial_presence_section() {
        let yaml = "presence:\n  poll_interval_ms: 30000\n";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.presence.poll_interval_ms, 30_000);
        assert_eq!(config.presence.timeout_window_ms, DEFAULT_TIMEOUT_WINDOW_MS);
    }

    #[test]
    fn test_poll_must_be_less_than_timeout() {
        let presence = PresenceConfig {
            poll_interval_ms: 90_000,
            ..PresenceConfig::default()
        };
        let err = ConfigValidator::validate_presence(&presence).unwrap_err();
        assert!(err.to_string().contains("presence.poll_interval_ms"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let presence = PresenceConfig {
            check_interval_ms: 0,
            ..PresenceConfig::default()
        };
        let err = ConfigValidator::validate_presence(&presence).unwrap_err();
        assert!(err.to_string().contains("presence.check_interval_ms"));
    }

    #[test]
    fn test_huge_intervals_rejected() {
        let presence = PresenceConfig {
            poll_interval_ms: u64::MAX - 1,
            timeout_window_ms: u64::MAX,
            ..PresenceConfig::default()
        };
        let err = ConfigValidator::validate_presence(&presence).unwrap_err();
        assert!(err.to_string().contains("presence.poll_interval_ms"));

        let presence = PresenceConfig {
            observer_grace_ms: MAX_INTERVAL_MS + 1,
            ..PresenceConfig::default()
        };
        assert!(ConfigValidator::validate_presence(&presence).is_err());
        assert!(ConfigValidator::validate_presence(&PresenceConfig {
            timeout_window_ms: MAX_INTERVAL_MS,
            ..PresenceConfig::default()
        })
        .is_ok());
    }

    #[test]
    fn test_suppress_window_bounded_by_poll() {
        let presence = PresenceConfig {
            suppress_window_ms: 60_000,
            ..PresenceConfig::default()
        };
        assert!(ConfigValidator::validate_presence(&presence).is_err());
    }

    #[test]
    fn test_save_and_load_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peerwatch.yaml");
        Config::sample().save(&path).unwrap();

        let loaded = Config::load(&Some(path.display().to_string())).unwrap();
        assert_eq!(loaded.account.contacts.len(), 3);
        assert_eq!(loaded.account.id, Some(AccountId::new("local-account")));
        assert_eq!(loaded.simulator.seed, Some(7));
    }

    #[test]
    fn test_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(err.to_string().starts_with("Config not found"));
    }
}
