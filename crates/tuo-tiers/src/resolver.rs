//! Tier Capability Resolver
//!
//! Pure diff over the capability table: given the current and target tier,
//! report which features appear, which disappear and which data transforms
//! the migration step has to apply.
//!
//! Removed features never translate into deletion. They produce
//! [`DataTransform::ArchiveFeature`] so a later re-upgrade can bring the data
//! back through [`DataTransform::ActivateFeature`].

use crate::capability::{FeatureId, Limits, TierCapabilitySet};
use crate::error::TierConfigError;
use crate::tier::{BillingInterval, Tier};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Direction of a tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDirection {
    /// Target ranks above current
    Upgrade,
    /// Target ranks below current
    Downgrade,
    /// Same tier (only reachable through [`TierResolver::diff`] directly)
    Lateral,
}

/// Data-shape change required by a tier transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataTransform {
    /// Enable a feature namespace, un-archiving earlier data if present
    ActivateFeature {
        /// Feature to activate
        feature: FeatureId,
    },
    /// Move a feature namespace to the archive
    ArchiveFeature {
        /// Feature to archive
        feature: FeatureId,
    },
    /// Replace the account's usage limits
    ApplyLimits {
        /// Limits in force before the change
        from: Limits,
        /// Limits in force after the change
        to: Limits,
    },
}

impl Display for DataTransform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DataTransform::ActivateFeature { feature } => write!(f, "activate {feature}"),
            DataTransform::ArchiveFeature { feature } => write!(f, "archive {feature}"),
            DataTransform::ApplyLimits { .. } => f.write_str("apply limits"),
        }
    }
}

/// Result of diffing two tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDiff {
    /// Tier before the change
    pub from: Tier,
    /// Tier after the change
    pub to: Tier,
    /// Upgrade / downgrade classification
    pub direction: ChangeDirection,
    /// Features present in `to` but not in `from`
    pub added_features: Vec<FeatureId>,
    /// Features present in `from` but not in `to`
    pub removed_features: Vec<FeatureId>,
    /// Ordered transforms: archives, then activations, then limits
    pub data_transforms: Vec<DataTransform>,
}

impl TierDiff {
    /// True when nothing needs to change
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_transforms.is_empty()
    }
}

/// Shared, read-only resolver over a capability table
#[derive(Debug, Clone)]
pub struct TierResolver {
    table: Arc<TierCapabilitySet>,
}

impl TierResolver {
    /// Create a resolver over a shared table
    #[inline]
    #[must_use]
    pub fn new(table: Arc<TierCapabilitySet>) -> Self {
        Self { table }
    }

    /// Resolver over the built-in table
    #[inline]
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(TierCapabilitySet::builtin())
    }

    /// Underlying table
    #[inline]
    #[must_use]
    pub fn table(&self) -> &TierCapabilitySet {
        &self.table
    }

    /// Check that `tier` bills on `interval`
    ///
    /// # Errors
    /// Returns error if the tier is missing or the interval unsupported
    pub fn ensure_interval(
        &self,
        tier: Tier,
        interval: BillingInterval,
    ) -> Result<(), TierConfigError> {
        self.table.price(tier, interval).map(|_| ())
    }

    /// Compute the capability diff between two tiers
    ///
    /// # Errors
    /// Returns [`TierConfigError::MissingTier`] if either tier is not in the table
    pub fn diff(&self, current: Tier, target: Tier) -> Result<TierDiff, TierConfigError> {
        let from = self.table.definition(current)?;
        let to = self.table.definition(target)?;

        let added_features: Vec<FeatureId> =
            to.features.difference(&from.features).cloned().collect();
        let removed_features: Vec<FeatureId> =
            from.features.difference(&to.features).cloned().collect();

        let mut data_transforms = Vec::with_capacity(added_features.len() + removed_features.len() + 1);
        data_transforms.extend(
            removed_features
                .iter()
                .cloned()
                .map(|feature| DataTransform::ArchiveFeature { feature }),
        );
        data_transforms.extend(
            added_features
                .iter()
                .cloned()
                .map(|feature| DataTransform::ActivateFeature { feature }),
        );
        if from.limits != to.limits {
            data_transforms.push(DataTransform::ApplyLimits {
                from: from.limits,
                to: to.limits,
            });
        }

        let direction = match target.rank().cmp(&current.rank()) {
            std::cmp::Ordering::Greater => ChangeDirection::Upgrade,
            std::cmp::Ordering::Less => ChangeDirection::Downgrade,
            std::cmp::Ordering::Equal => ChangeDirection::Lateral,
        };

        Ok(TierDiff {
            from: current,
            to: target,
            direction,
            added_features,
            removed_features,
            data_transforms,
        })
    }
}

impl Default for TierResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier_strategy() -> impl Strategy<Value = Tier> {
        prop_oneof![
            Just(Tier::Free),
            Just(Tier::Starter),
            Just(Tier::Professional),
            Just(Tier::Enterprise),
            Just(Tier::Ultimate),
        ]
    }

    #[test]
    fn starter_to_professional_adds_features() {
        let diff = TierResolver::builtin()
            .diff(Tier::Starter, Tier::Professional)
            .unwrap();
        assert_eq!(diff.direction, ChangeDirection::Upgrade);
        assert!(diff.removed_features.is_empty());
        assert!(diff.added_features.contains(&FeatureId::new("learning_insights")));
        assert!(matches!(
            diff.data_transforms.last(),
            Some(DataTransform::ApplyLimits { .. })
        ));
    }

    #[test]
    fn downgrade_archives_instead_of_deleting() {
        let diff = TierResolver::builtin()
            .diff(Tier::Enterprise, Tier::Starter)
            .unwrap();
        assert_eq!(diff.direction, ChangeDirection::Downgrade);
        assert!(diff.added_features.is_empty());
        assert!(diff
            .data_transforms
            .iter()
            .any(|t| matches!(t, DataTransform::ArchiveFeature { feature } if feature.as_str() == "sso")));
    }

    #[test]
    fn same_tier_is_lateral_and_empty() {
        let diff = TierResolver::builtin()
            .diff(Tier::Professional, Tier::Professional)
            .unwrap();
        assert_eq!(diff.direction, ChangeDirection::Lateral);
        assert!(diff.is_empty());
    }

    #[test]
    fn ensure_interval_rejects_yearly_free() {
        let resolver = TierResolver::builtin();
        assert!(resolver.ensure_interval(Tier::Free, BillingInterval::Yearly).is_err());
        assert!(resolver.ensure_interval(Tier::Starter, BillingInterval::Yearly).is_ok());
    }

    proptest! {
        #[test]
        fn prop_diff_is_antisymmetric(a in tier_strategy(), b in tier_strategy()) {
            let resolver = TierResolver::builtin();
            let forward = resolver.diff(a, b).unwrap();
            let backward = resolver.diff(b, a).unwrap();
            prop_assert_eq!(&forward.added_features, &backward.removed_features);
            prop_assert_eq!(&forward.removed_features, &backward.added_features);
        }

        #[test]
        fn prop_archives_precede_activations(a in tier_strategy(), b in tier_strategy()) {
            let diff = TierResolver::builtin().diff(a, b).unwrap();
            let first_activate = diff
                .data_transforms
                .iter()
                .position(|t| matches!(t, DataTransform::ActivateFeature { .. }));
            let last_archive = diff
                .data_transforms
                .iter()
                .rposition(|t| matches!(t, DataTransform::ArchiveFeature { .. }));
            if let (Some(act), Some(arc)) = (first_activate, last_archive) {
                prop_assert!(arc < act);
            }
        }
    }
}
