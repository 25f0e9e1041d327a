//! Orchestrator configuration
//!
//! Loaded once at process start. Every field has a default so a partial
//! TOML file is enough.

use crate::error::UpgradeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tuo_snapshot::RetentionPolicy;
use tuo_tiers::{TierCapabilitySet, TierResolver};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per data transform before the migration step fails
    pub max_transform_attempts: u32,
    /// Base delay between transform attempts (multiplied by attempt number)
    pub retry_backoff_ms: u64,
    /// Buffered progress events per session channel
    pub progress_channel_capacity: usize,
    /// Preservation monitor polling interval
    pub monitor_poll_interval_ms: u64,
    /// Run the compensator automatically when a step fails
    pub auto_compensate: bool,
    /// What happens to a snapshot once its session is done
    pub snapshot_retention: RetentionPolicy,
    /// How long a finished session stays addressable by id
    pub session_retention_secs: u64,
    /// External capability table (YAML, TOML or JSON); built-in table if unset
    pub tiers_path: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With transform attempt bound
    #[inline]
    #[must_use]
    pub fn with_max_transform_attempts(mut self, attempts: u32) -> Self {
        self.max_transform_attempts = attempts.max(1);
        self
    }

    /// With retry backoff
    #[inline]
    #[must_use]
    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    /// With monitor polling interval
    #[inline]
    #[must_use]
    pub fn with_monitor_poll_interval_ms(mut self, ms: u64) -> Self {
        self.monitor_poll_interval_ms = ms;
        self
    }

    /// With automatic compensation on or off
    #[inline]
    #[must_use]
    pub fn with_auto_compensate(mut self, enabled: bool) -> Self {
        self.auto_compensate = enabled;
        self
    }

    /// With snapshot retention policy
    #[inline]
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.snapshot_retention = retention;
        self
    }

    /// With finished-session retention
    #[inline]
    #[must_use]
    pub fn with_session_retention_secs(mut self, secs: u64) -> Self {
        self.session_retention_secs = secs;
        self
    }

    /// With external capability table
    #[inline]
    #[must_use]
    pub fn with_tiers_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tiers_path = Some(path.into());
        self
    }

    /// Parse from TOML
    ///
    /// # Errors
    /// Returns [`UpgradeError::InvalidConfig`] on malformed input
    pub fn from_toml_str(text: &str) -> Result<Self, UpgradeError> {
        toml::from_str(text).map_err(|e| UpgradeError::InvalidConfig(e.to_string()))
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns [`UpgradeError::InvalidConfig`] if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UpgradeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| UpgradeError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Build the tier resolver this configuration points at
    ///
    /// # Errors
    /// Returns [`UpgradeError::Config`] if the external table is invalid
    pub fn resolver(&self) -> Result<TierResolver, UpgradeError> {
        match &self.tiers_path {
            Some(path) => Ok(TierResolver::new(Arc::new(TierCapabilitySet::load(path)?))),
            None => Ok(TierResolver::builtin()),
        }
    }

    /// Backoff before attempt `attempt` (1-based) is retried
    #[inline]
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Monitor polling interval
    #[inline]
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms.max(1))
    }

    /// Time-to-live of a finished session
    #[inline]
    #[must_use]
    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs.max(1))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_transform_attempts: 3,
            retry_backoff_ms: 50,
            progress_channel_capacity: 64,
            monitor_poll_interval_ms: 1000,
            auto_compensate: true,
            snapshot_retention: RetentionPolicy::default(),
            session_retention_secs: 86_400,
            tiers_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::new();
        assert_eq!(config.max_transform_attempts, 3);
        assert!(config.auto_compensate);
        assert!(matches!(config.snapshot_retention, RetentionPolicy::Archive { .. }));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
max_transform_attempts = 5

[snapshot_retention]
policy = "discard"
"#,
        )
        .unwrap();
        assert_eq!(config.max_transform_attempts, 5);
        assert_eq!(config.retry_backoff_ms, 50);
        assert_eq!(config.snapshot_retention, RetentionPolicy::Discard);
    }

    #[test]
    fn malformed_toml_is_invalid_config() {
        let err = OrchestratorConfig::from_toml_str("max_transform_attempts = \"three\"").unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidConfig(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "retry_backoff_ms = 0\nauto_compensate = false").unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.retry_backoff_ms, 0);
        assert!(!config.auto_compensate);
    }

    #[test]
    fn backoff_scales_with_attempt() {
        let config = OrchestratorConfig::new().with_retry_backoff_ms(10);
        assert_eq!(config.backoff(3), Duration::from_millis(30));
    }

    #[test]
    fn session_retention_never_zero() {
        assert_eq!(OrchestratorConfig::new().session_retention(), Duration::from_secs(86_400));
        let config = OrchestratorConfig::from_toml_str("session_retention_secs = 0").unwrap();
        assert_eq!(config.session_retention(), Duration::from_secs(1));
    }

    #[test]
    fn missing_tiers_file_is_config_error() {
        let config = OrchestratorConfig::new().with_tiers_path("/nonexistent/tiers.yaml");
        assert!(matches!(config.resolver(), Err(UpgradeError::Config(_))));
    }
}
