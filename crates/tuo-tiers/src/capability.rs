//! Static tier capability table
//!
//! Maps each [`Tier`] to its feature set, usage limits and price points.
//! The table is loaded once at process start and shared read-only (behind an
//! `Arc`) by every concurrent upgrade session.
//!
//! Files are read in their raw, string-keyed form first so that an unknown
//! tier or interval name surfaces as a [`TierConfigError`] rather than an
//! opaque deserializer message.

use crate::error::TierConfigError;
use crate::tier::{BillingInterval, Tier};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_TABLE_YAML: &str = include_str!("default_tiers.yaml");

static DEFAULT_TABLE: Lazy<Arc<TierCapabilitySet>> = Lazy::new(|| {
    let raw: RawCapabilityTable = serde_yaml::from_str(DEFAULT_TABLE_YAML)
        .unwrap_or_else(|e| panic!("built-in tier table is malformed: {e}"));
    let table = TierCapabilitySet::try_from(raw)
        .unwrap_or_else(|e| panic!("built-in tier table is invalid: {e}"));
    Arc::new(table)
});

/// Feature identifier (also names the feature's data namespace)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    /// Create a feature identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FeatureId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Usage limits for a tier; `None` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum seats
    pub max_users: Option<u64>,
    /// Maximum projects
    pub max_projects: Option<u64>,
    /// Maximum workflows
    pub max_workflows: Option<u64>,
    /// Storage quota in GB
    pub storage_gb: Option<u64>,
}

/// Capabilities of a single tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDefinition {
    /// Enabled features
    pub features: BTreeSet<FeatureId>,
    /// Usage limits
    pub limits: Limits,
    /// Price per billing interval, in minor currency units
    pub pricing: BTreeMap<BillingInterval, u64>,
}

impl TierDefinition {
    /// Check whether the tier bills on the given interval
    #[inline]
    #[must_use]
    pub fn supports(&self, interval: BillingInterval) -> bool {
        self.pricing.contains_key(&interval)
    }
}

/// Tier capability table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierCapabilitySet {
    currency: String,
    tiers: BTreeMap<Tier, TierDefinition>,
}

impl TierCapabilitySet {
    /// Built-in default table, shared
    #[must_use]
    pub fn builtin() -> Arc<Self> {
        Arc::clone(&DEFAULT_TABLE)
    }

    /// Parse from YAML
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation
    pub fn from_yaml(yaml: &str) -> Result<Self, TierConfigError> {
        let raw: RawCapabilityTable = serde_yaml::from_str(yaml)?;
        Self::try_from(raw)
    }

    /// Parse from TOML
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation
    pub fn from_toml(text: &str) -> Result<Self, TierConfigError> {
        let raw: RawCapabilityTable = toml::from_str(text)?;
        Self::try_from(raw)
    }

    /// Parse from JSON
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation
    pub fn from_json(json: &str) -> Result<Self, TierConfigError> {
        let raw: RawCapabilityTable = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Load from disk, choosing the format by file extension
    ///
    /// # Errors
    /// Returns error on I/O failure, unknown extension or invalid content
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TierConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml(&text),
            "toml" => Self::from_toml(&text),
            "json" => Self::from_json(&text),
            other => Err(TierConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Serialize to YAML (raw string-keyed form)
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_yaml(&self) -> Result<String, TierConfigError> {
        Ok(serde_yaml::to_string(&RawCapabilityTable::from(self))?)
    }

    /// Currency code for all prices
    #[inline]
    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Look up a tier definition
    ///
    /// # Errors
    /// Returns [`TierConfigError::MissingTier`] if absent
    pub fn definition(&self, tier: Tier) -> Result<&TierDefinition, TierConfigError> {
        self.tiers.get(&tier).ok_or(TierConfigError::MissingTier(tier))
    }

    /// Price of a tier on an interval
    ///
    /// # Errors
    /// Returns error if the tier is missing or does not bill on `interval`
    pub fn price(&self, tier: Tier, interval: BillingInterval) -> Result<u64, TierConfigError> {
        self.definition(tier)?
            .pricing
            .get(&interval)
            .copied()
            .ok_or(TierConfigError::UnsupportedInterval { tier, interval })
    }

    /// Iterate tiers in rank order
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &TierDefinition)> {
        self.tiers.iter().map(|(t, d)| (*t, d))
    }
}

/// String-keyed on-disk shape of the capability table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCapabilityTable {
    #[serde(default = "default_currency")]
    currency: String,
    tiers: BTreeMap<String, RawTierDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTierDefinition {
    #[serde(default)]
    features: BTreeSet<FeatureId>,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    pricing: BTreeMap<String, u64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TryFrom<RawCapabilityTable> for TierCapabilitySet {
    type Error = TierConfigError;

    fn try_from(raw: RawCapabilityTable) -> Result<Self, Self::Error> {
        let mut tiers = BTreeMap::new();
        for (name, def) in raw.tiers {
            let tier = Tier::from_str(&name)?;
            let mut pricing = BTreeMap::new();
            for (interval, amount) in def.pricing {
                pricing.insert(BillingInterval::from_str(&interval)?, amount);
            }
            if pricing.is_empty() {
                return Err(TierConfigError::NoPricing(tier));
            }
            tiers.insert(
                tier,
                TierDefinition {
                    features: def.features,
                    limits: def.limits,
                    pricing,
                },
            );
        }

        if let Some(missing) = Tier::ALL.iter().find(|t| !tiers.contains_key(t)) {
            return Err(TierConfigError::MissingTier(*missing));
        }

        Ok(Self {
            currency: raw.currency,
            tiers,
        })
    }
}

impl From<&TierCapabilitySet> for RawCapabilityTable {
    fn from(set: &TierCapabilitySet) -> Self {
        let tiers = set
            .tiers
            .iter()
            .map(|(tier, def)| {
                (
                    tier.as_str().to_string(),
                    RawTierDefinition {
                        features: def.features.clone(),
                        limits: def.limits,
                        pricing: def
                            .pricing
                            .iter()
                            .map(|(i, p)| (i.as_str().to_string(), *p))
                            .collect(),
                    },
                )
            })
            .collect();
        Self {
            currency: set.currency.clone(),
            tiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_table_has_every_tier() {
        let table = TierCapabilitySet::builtin();
        for tier in Tier::ALL {
            assert!(table.definition(tier).is_ok(), "missing {tier}");
        }
        assert_eq!(table.currency(), "USD");
    }

    #[test]
    fn builtin_free_is_monthly_only() {
        let table = TierCapabilitySet::builtin();
        let free = table.definition(Tier::Free).unwrap();
        assert!(free.supports(BillingInterval::Monthly));
        assert!(!free.supports(BillingInterval::Yearly));
        assert!(matches!(
            table.price(Tier::Free, BillingInterval::Yearly),
            Err(TierConfigError::UnsupportedInterval { .. })
        ));
    }

    #[test]
    fn builtin_ultimate_is_unlimited() {
        let table = TierCapabilitySet::builtin();
        let ultimate = table.definition(Tier::Ultimate).unwrap();
        assert_eq!(ultimate.limits, Limits::default());
    }

    #[test]
    fn yaml_missing_tier_rejected() {
        let yaml = r"
tiers:
  free:
    pricing: { monthly: 0 }
";
        let err = TierCapabilitySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TierConfigError::MissingTier(Tier::Starter)));
    }

    #[test]
    fn yaml_unknown_tier_rejected() {
        let yaml = r"
tiers:
  platinum:
    pricing: { monthly: 10 }
";
        let err = TierCapabilitySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TierConfigError::UnknownTier(_)));
    }

    #[test]
    fn tier_without_pricing_rejected() {
        let yaml = r"
tiers:
  free:
    features: [session_memory]
";
        let err = TierCapabilitySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TierConfigError::NoPricing(Tier::Free)));
    }

    #[test]
    fn yaml_round_trip_preserves_table() {
        let table = TierCapabilitySet::builtin();
        let yaml = table.to_yaml().unwrap();
        let back = TierCapabilitySet::from_yaml(&yaml).unwrap();
        assert_eq!(*table, back);
    }

    #[test]
    fn toml_file_loads_by_extension() {
        let mut doc = String::from("currency = \"EUR\"\n");
        for tier in Tier::ALL {
            doc.push_str(&format!(
                "[tiers.{tier}]\nfeatures = [\"session_memory\"]\n[tiers.{tier}.pricing]\nmonthly = 100\n"
            ));
        }
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(doc.as_bytes()).unwrap();

        let table = TierCapabilitySet::load(file.path()).unwrap();
        assert_eq!(table.currency(), "EUR");
        assert_eq!(table.price(Tier::Enterprise, BillingInterval::Monthly).unwrap(), 100);
    }

    #[test]
    fn unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = TierCapabilitySet::load(file.path()).unwrap_err();
        assert!(matches!(err, TierConfigError::UnsupportedFormat(ref e) if e == "ini"));
    }
}
