//! Tier and billing interval identifiers
//!
//! Both enums are ordered: [`Tier`] by rank (free lowest), which is what the
//! resolver uses to classify a change as an upgrade or a downgrade.

use crate::error::TierConfigError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free tier
    Free,
    /// Starter tier
    Starter,
    /// Professional tier
    Professional,
    /// Enterprise tier
    Enterprise,
    /// Ultimate tier
    Ultimate,
}

impl Tier {
    /// All tiers, lowest rank first
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Starter,
        Tier::Professional,
        Tier::Enterprise,
        Tier::Ultimate,
    ];

    /// Numeric rank (0 = free)
    #[inline]
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Starter => 1,
            Tier::Professional => 2,
            Tier::Enterprise => 3,
            Tier::Ultimate => 4,
        }
    }

    /// Stable identifier used in configuration files
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
            Tier::Ultimate => "ultimate",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = TierConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            "ultimate" => Ok(Tier::Ultimate),
            _ => Err(TierConfigError::UnknownTier(s.to_string())),
        }
    }
}

/// Billing interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Billed every month
    Monthly,
    /// Billed once a year
    Yearly,
}

impl BillingInterval {
    /// Stable identifier used in configuration files
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }
}

impl Display for BillingInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = TierConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(BillingInterval::Monthly),
            "yearly" | "annual" => Ok(BillingInterval::Yearly),
            _ => Err(TierConfigError::UnknownInterval(s.to_string())),
        }
    }
}
