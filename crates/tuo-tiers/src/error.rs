//! Error types for the tier capability table

use crate::tier::{BillingInterval, Tier};

/// Configuration errors raised while loading or querying the capability table
///
/// These are configuration problems, never runtime failures of an upgrade.
#[derive(Debug, thiserror::Error)]
pub enum TierConfigError {
    /// Tier identifier not recognised
    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// Billing interval identifier not recognised
    #[error("unknown billing interval: {0}")]
    UnknownInterval(String),

    /// Tier absent from the capability table
    #[error("tier {0} is not defined in the capability table")]
    MissingTier(Tier),

    /// Tier defined without any price point
    #[error("tier {0} has no price for any billing interval")]
    NoPricing(Tier),

    /// Tier does not offer the requested interval
    #[error("tier {tier} does not support {interval} billing")]
    UnsupportedInterval {
        /// Tier queried
        tier: Tier,
        /// Interval requested
        interval: BillingInterval,
    },

    /// Unsupported configuration file extension
    #[error("unsupported capability table format: {0}")]
    UnsupportedFormat(String),

    /// YAML parse error
    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    /// TOML parse error
    #[error("invalid TOML: {0}")]
    InvalidToml(#[from] toml::de::Error),

    /// JSON parse error
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// I/O error while reading a table from disk
    #[error("failed to read capability table: {0}")]
    Io(#[from] std::io::Error),
}
