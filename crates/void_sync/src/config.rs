//! Sync session configuration
//!
//! Loaded from TOML; every key is optional.
//!
//! ```toml
//! session = "level-01"
//! transform_interval_ms = 75
//! position_epsilon = 0.0001
//! rotation_epsilon_deg = 0.01
//! max_calls_per_second = 30
//! dry_run = false
//! journal_enabled = true
//! scan_nodes_on_tick = true
//! resource_poll_interval_ms = 250
//! sweep_interval_ms = 5000
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use void_scene::Tolerance;

/// Lower bound for the transform flush interval
pub const MIN_TRANSFORM_INTERVAL_MS: u64 = 20;
/// Upper bound for the transform flush interval
pub const MAX_TRANSFORM_INTERVAL_MS: u64 = 500;
/// Default transform flush interval
pub const DEFAULT_TRANSFORM_INTERVAL_MS: u64 = 75;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Session qualifier sent with every call
    pub session: String,
    /// Per-node Transform flush interval (clamped to [20, 500])
    pub transform_interval_ms: u64,
    /// Distance under which two points/vectors are equal
    pub position_epsilon: f32,
    /// Angle (degrees) under which two rotations are equal
    pub rotation_epsilon_deg: f32,
    /// Outgoing call budget; overflow waits for the next window
    pub max_calls_per_second: u32,
    /// Compute sizes and metrics without sending
    pub dry_run: bool,
    /// Record dispatched ops for replay
    pub journal_enabled: bool,
    /// Re-scan the whole graph on each tick (hosts without push events)
    pub scan_nodes_on_tick: bool,
    /// Re-snapshot interval for shared resources
    pub resource_poll_interval_ms: u64,
    /// Liveness sweep interval for the identity registry
    pub sweep_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session: "default".to_string(),
            transform_interval_ms: DEFAULT_TRANSFORM_INTERVAL_MS,
            position_epsilon: 1e-4,
            rotation_epsilon_deg: 0.01,
            max_calls_per_second: 30,
            dry_run: false,
            journal_enabled: true,
            scan_nodes_on_tick: true,
            resource_poll_interval_ms: 250,
            sweep_interval_ms: 5000,
        }
    }
}

impl SyncConfig {
    /// Parse from a TOML string and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Set the session qualifier
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Set the transform interval (clamped when read)
    pub fn with_transform_interval_ms(mut self, ms: u64) -> Self {
        self.transform_interval_ms = ms;
        self
    }

    /// Enable or disable dry-run dispatch
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the outgoing call budget
    pub fn with_max_calls_per_second(mut self, calls: u32) -> Self {
        self.max_calls_per_second = calls;
        self
    }

    /// Reject values that cannot produce a working session.
    ///
    /// An out-of-range transform interval is not an error; it is clamped
    /// and reported once here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.position_epsilon.is_finite() || self.position_epsilon < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "position_epsilon must be a non-negative number, got {}",
                self.position_epsilon
            )));
        }
        if !self.rotation_epsilon_deg.is_finite() || self.rotation_epsilon_deg < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "rotation_epsilon_deg must be a non-negative number, got {}",
                self.rotation_epsilon_deg
            )));
        }
        if self.max_calls_per_second == 0 {
            return Err(ConfigError::Invalid(
                "max_calls_per_second must be at least 1".to_string(),
            ));
        }
        if self.session.is_empty() {
            return Err(ConfigError::Invalid("session must not be empty".to_string()));
        }

        let clamped = self.clamped_interval_ms();
        if clamped != self.transform_interval_ms {
            log::warn!(
                "transform_interval_ms {} outside [{}, {}], using {}",
                self.transform_interval_ms,
                MIN_TRANSFORM_INTERVAL_MS,
                MAX_TRANSFORM_INTERVAL_MS,
                clamped
            );
        }
        Ok(())
    }

    fn clamped_interval_ms(&self) -> u64 {
        self.transform_interval_ms
            .clamp(MIN_TRANSFORM_INTERVAL_MS, MAX_TRANSFORM_INTERVAL_MS)
    }

    /// Effective per-node Transform flush interval
    pub fn transform_interval(&self) -> Duration {
        Duration::from_millis(self.clamped_interval_ms())
    }

    /// Diff tolerances
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::new(self.position_epsilon, self.rotation_epsilon_deg)
    }

    pub fn resource_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resource_poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.transform_interval(), Duration::from_millis(75));
        assert_eq!(config.max_calls_per_second, 30);
        assert!(config.journal_enabled);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            session = "level-01"
            dry_run = true
            "#,
        )
        .unwrap();
        assert_eq!(config.session, "level-01");
        assert!(config.dry_run);
        assert_eq!(config.transform_interval_ms, DEFAULT_TRANSFORM_INTERVAL_MS);
    }

    #[test]
    fn test_interval_clamped() {
        let low = SyncConfig::default().with_transform_interval_ms(5);
        assert_eq!(low.transform_interval(), Duration::from_millis(20));

        let high = SyncConfig::from_toml_str("transform_interval_ms = 2000").unwrap();
        assert_eq!(high.transform_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_rejected() {
        assert!(matches!(
            SyncConfig::from_toml_str("max_calls_per_second = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml_str("position_epsilon = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml_str("dry_run = \"yes\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
