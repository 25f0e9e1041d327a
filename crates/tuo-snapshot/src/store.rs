//! Data store collaborator
//!
//! The orchestrator never owns user data. [`DataStore`] is the narrow
//! per-category read/write surface it consumes, plus the feature-namespace
//! and limit records that tier migrations touch.
//!
//! [`InMemoryDataStore`] backs tests and simulations.

use crate::error::StoreError;
use crate::ids::UserId;
use crate::item::{Category, ItemKey, StoredItem};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tuo_tiers::{FeatureId, Limits};

/// State of a feature's data namespace for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    /// Namespace never created
    #[default]
    Absent,
    /// Namespace live and writable
    Active,
    /// Namespace retained in the archive, not visible to the user
    Archived,
}

/// Per-category user data access
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// List every item of a category, ordered by identifier
    async fn list(&self, user: &UserId, category: Category) -> Result<Vec<StoredItem>, StoreError>;

    /// Read a single item
    async fn read(&self, user: &UserId, key: &ItemKey) -> Result<Option<StoredItem>, StoreError>;

    /// Create or overwrite an item
    async fn write(&self, user: &UserId, item: StoredItem) -> Result<(), StoreError>;

    /// Current state of a feature namespace
    async fn feature_state(&self, user: &UserId, feature: &FeatureId)
        -> Result<FeatureState, StoreError>;

    /// Move a feature namespace to a new state
    async fn set_feature_state(
        &self,
        user: &UserId,
        feature: &FeatureId,
        state: FeatureState,
    ) -> Result<(), StoreError>;

    /// Usage limits currently applied to the user, if any were ever set
    async fn limits(&self, user: &UserId) -> Result<Option<Limits>, StoreError>;

    /// Replace (or clear) the user's usage limits
    async fn set_limits(&self, user: &UserId, limits: Option<Limits>) -> Result<(), StoreError>;
}

/// In-memory [`DataStore`]
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    items: DashMap<UserId, BTreeMap<ItemKey, serde_json::Value>>,
    features: DashMap<(UserId, FeatureId), FeatureState>,
    limits: DashMap<UserId, Limits>,
}

impl InMemoryDataStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item synchronously (seeding helper)
    pub fn insert(&self, user: &UserId, item: StoredItem) {
        self.items
            .entry(user.clone())
            .or_default()
            .insert(item.key, item.payload);
    }

    /// Remove an item, returning its payload
    pub fn remove(&self, user: &UserId, key: &ItemKey) -> Option<serde_json::Value> {
        self.items.get_mut(user).and_then(|mut map| map.remove(key))
    }

    /// Number of items held for a user
    #[must_use]
    pub fn item_count(&self, user: &UserId) -> usize {
        self.items.get(user).map_or(0, |map| map.len())
    }

    /// Feature namespace state, synchronously
    #[must_use]
    pub fn feature(&self, user: &UserId, feature: &FeatureId) -> FeatureState {
        self.features
            .get(&(user.clone(), feature.clone()))
            .map(|s| *s)
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DataStore for InMemoryDataStore {
    async fn list(&self, user: &UserId, category: Category) -> Result<Vec<StoredItem>, StoreError> {
        Ok(self
            .items
            .get(user)
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| k.category == category)
                    .map(|(k, v)| StoredItem::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read(&self, user: &UserId, key: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
        Ok(self
            .items
            .get(user)
            .and_then(|map| map.get(key).map(|v| StoredItem::new(key.clone(), v.clone()))))
    }

    async fn write(&self, user: &UserId, item: StoredItem) -> Result<(), StoreError> {
        self.insert(user, item);
        Ok(())
    }

    async fn feature_state(
        &self,
        user: &UserId,
        feature: &FeatureId,
    ) -> Result<FeatureState, StoreError> {
        Ok(self.feature(user, feature))
    }

    async fn set_feature_state(
        &self,
        user: &UserId,
        feature: &FeatureId,
        state: FeatureState,
    ) -> Result<(), StoreError> {
        let key = (user.clone(), feature.clone());
        if state == FeatureState::Absent {
            self.features.remove(&key);
        } else {
            self.features.insert(key, state);
        }
        Ok(())
    }

    async fn limits(&self, user: &UserId) -> Result<Option<Limits>, StoreError> {
        Ok(self.limits.get(user).map(|l| *l))
    }

    async fn set_limits(&self, user: &UserId, limits: Option<Limits>) -> Result<(), StoreError> {
        match limits {
            Some(limits) => {
                self.limits.insert(user.clone(), limits);
            }
            None => {
                self.limits.remove(user);
            }
        }
        Ok(())
    }
}
