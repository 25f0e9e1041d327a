//! Testing utilities for the tier upgrade orchestrator workspace
//!
//! Shared fault-injecting collaborators, fixtures and a ready-wired harness.

#![allow(missing_docs)]

use dashmap::{DashMap, DashSet};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tuo_core::{
    AccountDirectory, AccountError, AccountPlan, AuditLog, Collaborators, InMemoryAccounts,
    MigrationExecutor, OrchestratorConfig, SimulatedBilling,
};
use tuo_snapshot::{
    Category, DataStore, FeatureState, InMemoryDataStore, ItemKey, StoreError, StoredItem, UserId,
};
use tuo_tiers::{BillingInterval, FeatureId, Limits, Tier, TierResolver};

/// How often a faulty feature keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBudget {
    Always,
    Times(u32),
}

/// [`InMemoryDataStore`] with switchable faults
#[derive(Debug)]
pub struct FaultyDataStore {
    inner: InMemoryDataStore,
    unreachable: AtomicBool,
    rejected_writes: DashSet<ItemKey>,
    failing_features: DashMap<FeatureId, FailureBudget>,
    list_gate: watch::Sender<bool>,
}

impl Default for FaultyDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyDataStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryDataStore::new(),
            unreachable: AtomicBool::new(false),
            rejected_writes: DashSet::new(),
            failing_features: DashMap::new(),
            list_gate: watch::channel(true).0,
        }
    }

    /// Backing store, for seeding and inspection
    pub fn inner(&self) -> &InMemoryDataStore {
        &self.inner
    }

    /// Every call fails with [`StoreError::Unreachable`]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Writes to `key` fail with [`StoreError::Rejected`]
    pub fn reject_writes(&self, key: ItemKey) {
        self.rejected_writes.insert(key);
    }

    /// Accept writes again for every key
    pub fn accept_writes(&self) {
        self.rejected_writes.clear();
    }

    /// `set_feature_state` for `feature` fails with [`StoreError::Unreachable`]
    pub fn fail_feature(&self, feature: impl Into<FeatureId>, budget: FailureBudget) {
        self.failing_features.insert(feature.into(), budget);
    }

    /// Stop feature faults
    pub fn heal_features(&self) {
        self.failing_features.clear();
    }

    /// Block `list` calls until [`open_listing`](Self::open_listing)
    pub fn hold_listing(&self) {
        self.list_gate.send_replace(false);
    }

    /// Release blocked `list` calls
    pub fn open_listing(&self) {
        self.list_gate.send_replace(true);
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    fn feature_fault(&self, feature: &FeatureId) -> Result<(), StoreError> {
        let Some(mut budget) = self.failing_features.get_mut(feature) else {
            return Ok(());
        };
        match *budget {
            FailureBudget::Always => {}
            FailureBudget::Times(0) => return Ok(()),
            FailureBudget::Times(n) => *budget = FailureBudget::Times(n - 1),
        }
        Err(StoreError::Unreachable(format!("injected fault for {feature}")))
    }
}

#[async_trait::async_trait]
impl DataStore for FaultyDataStore {
    async fn list(&self, user: &UserId, category: Category) -> Result<Vec<StoredItem>, StoreError> {
        let mut gate = self.list_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.check_reachable()?;
        self.inner.list(user, category).await
    }

    async fn read(&self, user: &UserId, key: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
        self.check_reachable()?;
        self.inner.read(user, key).await
    }

    async fn write(&self, user: &UserId, item: StoredItem) -> Result<(), StoreError> {
        self.check_reachable()?;
        if self.rejected_writes.contains(&item.key) {
            return Err(StoreError::Rejected {
                key: item.key,
                reason: "injected write rejection".into(),
            });
        }
        self.inner.write(user, item).await
    }

    async fn feature_state(
        &self,
        user: &UserId,
        feature: &FeatureId,
    ) -> Result<FeatureState, StoreError> {
        self.check_reachable()?;
        self.inner.feature_state(user, feature).await
    }

    async fn set_feature_state(
        &self,
        user: &UserId,
        feature: &FeatureId,
        state: FeatureState,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.feature_fault(feature)?;
        self.inner.set_feature_state(user, feature, state).await
    }

    async fn limits(&self, user: &UserId) -> Result<Option<Limits>, StoreError> {
        self.check_reachable()?;
        self.inner.limits(user).await
    }

    async fn set_limits(&self, user: &UserId, limits: Option<Limits>) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.inner.set_limits(user, limits).await
    }
}

/// [`InMemoryAccounts`] whose plan lookups can be held open
#[derive(Debug)]
pub struct GatedAccounts {
    inner: InMemoryAccounts,
    lookups: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for GatedAccounts {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedAccounts {
    pub fn new() -> Self {
        Self {
            inner: InMemoryAccounts::new(),
            lookups: AtomicUsize::new(0),
            gate: watch::channel(true).0,
        }
    }

    pub fn inner(&self) -> &InMemoryAccounts {
        &self.inner
    }

    /// `plan_of` calls started so far, including held ones
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Block `plan_of` until [`open_lookups`](Self::open_lookups)
    pub fn hold_lookups(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_lookups(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait::async_trait]
impl AccountDirectory for GatedAccounts {
    async fn plan_of(&self, user: &UserId) -> Result<Option<AccountPlan>, AccountError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.plan_of(user).await
    }

    async fn set_plan(&self, user: &UserId, plan: AccountPlan) -> Result<(), AccountError> {
        self.inner.set_plan(user, plan).await
    }
}

/// Seed `n` items for `user`, spread round-robin over every category
pub fn seed_items(store: &InMemoryDataStore, user: &UserId, n: usize) -> Vec<ItemKey> {
    (0..n)
        .map(|i| {
            let category = Category::ALL[i % Category::ALL.len()];
            let key = ItemKey::new(category, format!("item-{i:03}"));
            store.insert(
                user,
                StoredItem::new(key.clone(), json!({ "index": i, "body": format!("{category} payload {i}") })),
            );
            key
        })
        .collect()
}

/// Executor wired to fault-injecting and simulated collaborators
pub struct Harness {
    pub data: Arc<FaultyDataStore>,
    pub billing: Arc<SimulatedBilling>,
    pub accounts: Arc<InMemoryAccounts>,
    pub audit: Arc<AuditLog>,
    pub executor: MigrationExecutor,
}

impl Harness {
    /// Harness with zero retry backoff
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::new().with_retry_backoff_ms(0))
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let data = Arc::new(FaultyDataStore::new());
        let billing = Arc::new(SimulatedBilling::new());
        let accounts = Arc::new(InMemoryAccounts::new());
        let audit = Arc::new(AuditLog::new());
        let executor = MigrationExecutor::new(
            config,
            TierResolver::builtin(),
            Collaborators {
                data: data.clone(),
                billing: billing.clone(),
                accounts: accounts.clone(),
            },
        );
        executor.add_observer(audit.clone());
        Self {
            data,
            billing,
            accounts,
            audit,
            executor,
        }
    }

    /// Register `user` on `tier`/monthly with `items` seeded items
    pub fn user(&self, user: &str, tier: Tier, items: usize) -> (UserId, Vec<ItemKey>) {
        let id = UserId::new(user);
        self.accounts
            .insert(id.clone(), AccountPlan::new(tier, BillingInterval::Monthly));
        let keys = seed_items(self.data.inner(), &id, items);
        (id, keys)
    }

    pub fn tier_of(&self, user: &UserId) -> Tier {
        self.accounts.plan(user).tier
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_across_categories() {
        let store = InMemoryDataStore::new();
        let user = UserId::new("u");
        let keys = seed_items(&store, &user, 12);
        assert_eq!(keys.len(), 12);
        assert_eq!(store.item_count(&user), 12);
    }

    #[tokio::test]
    async fn feature_fault_budget_runs_out() {
        let store = FaultyDataStore::new();
        let user = UserId::new("u");
        let sso = FeatureId::new("sso");
        store.fail_feature(sso.clone(), FailureBudget::Times(2));
        for _ in 0..2 {
            assert!(store.set_feature_state(&user, &sso, FeatureState::Active).await.is_err());
        }
        assert!(store.set_feature_state(&user, &sso, FeatureState::Active).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_writes_only_hit_listed_keys() {
        let store = FaultyDataStore::new();
        let user = UserId::new("u");
        let bad = ItemKey::new(Category::SavedReport, "bad");
        store.reject_writes(bad.clone());
        assert!(store.write(&user, StoredItem::new(bad, json!(1))).await.is_err());
        assert!(store
            .write(&user, StoredItem::new(ItemKey::new(Category::SavedReport, "ok"), json!(1)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn held_lookup_waits_for_open() {
        let accounts = Arc::new(GatedAccounts::new());
        accounts.hold_lookups();
        let pending = {
            let accounts = Arc::clone(&accounts);
            tokio::spawn(async move { accounts.plan_of(&UserId::new("u")).await })
        };
        while accounts.lookups() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());
        accounts.open_lookups();
        assert_eq!(pending.await.unwrap().unwrap(), None);
    }
}
