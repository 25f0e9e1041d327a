//! Snapshot Store
//!
//! Captures a versioned, hashed copy of every preservation item before a
//! migration starts, verifies or restores live data against it, and retires
//! it according to the [`RetentionPolicy`] once the owning session is done.
//!
//! Payload copies are kept per snapshot, content-addressed by
//! [`ContentHash`]. Archived snapshots move into a TTL cache so retention
//! expiry needs no background sweeper.

use crate::error::{SnapshotError, StoreError};
use crate::hash::ContentHash;
use crate::ids::{SessionId, SnapshotId, UserId};
use crate::item::{Category, ItemKey, StoredItem};
use crate::snapshot::{
    DataSnapshot, ItemOutcome, PayloadRef, RestoreReport, RetentionPolicy, SnapshotItem,
};
use crate::store::DataStore;
use dashmap::DashMap;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type Payloads = Arc<HashMap<ContentHash, serde_json::Value>>;

/// Snapshot retired to cold storage
#[derive(Debug, Clone)]
struct ArchivedSnapshot {
    snapshot: Arc<DataSnapshot>,
    payloads: Payloads,
}

/// Where a snapshot currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLocation {
    /// Held for an in-flight session
    Active,
    /// Retired to cold storage
    Archived,
}

/// Snapshot store over a [`DataStore`] collaborator
pub struct SnapshotStore {
    data: Arc<dyn DataStore>,
    active: DashMap<SnapshotId, (Arc<DataSnapshot>, Payloads)>,
    archive: Cache<SnapshotId, ArchivedSnapshot>,
    latest_by_user: DashMap<UserId, SnapshotId>,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("active", &self.active.len())
            .field("archived", &self.archive.entry_count())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Create a store with the default retention policy
    #[must_use]
    pub fn new(data: Arc<dyn DataStore>) -> Self {
        Self::with_retention(data, RetentionPolicy::default())
    }

    /// Create a store with an explicit retention policy
    #[must_use]
    pub fn with_retention(data: Arc<dyn DataStore>, retention: RetentionPolicy) -> Self {
        let ttl = match retention {
            RetentionPolicy::Archive { ttl_secs } => Duration::from_secs(ttl_secs.max(1)),
            RetentionPolicy::Discard => Duration::from_secs(1),
        };
        Self {
            data,
            active: DashMap::new(),
            archive: Cache::builder().time_to_live(ttl).build(),
            latest_by_user: DashMap::new(),
            retention,
        }
    }

    /// Data store this snapshot store reads from
    #[inline]
    #[must_use]
    pub fn data_store(&self) -> &Arc<dyn DataStore> {
        &self.data
    }

    /// Retention policy in force
    #[inline]
    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Capture every preservation category for `user`
    ///
    /// # Errors
    /// Returns [`SnapshotError::CaptureFailed`] if any category cannot be
    /// listed; no partial snapshot is kept.
    pub async fn capture(
        &self,
        user: &UserId,
        session_id: SessionId,
    ) -> Result<Arc<DataSnapshot>, SnapshotError> {
        let listings = futures::future::try_join_all(
            Category::ALL.iter().map(|category| self.data.list(user, *category)),
        )
        .await
        .map_err(|source| SnapshotError::CaptureFailed {
            user_id: user.clone(),
            source,
        })?;

        let snapshot_id = SnapshotId::new();
        let mut items = Vec::new();
        let mut payloads = HashMap::new();
        for item in listings.into_iter().flatten() {
            let hash = ContentHash::compute_json(&item.payload)?;
            items.push(SnapshotItem {
                key: item.key,
                payload_hash: hash,
                payload_ref: PayloadRef { snapshot_id, hash },
            });
            payloads.entry(hash).or_insert(item.payload);
        }

        let snapshot = Arc::new(DataSnapshot::new(snapshot_id, session_id, user.clone(), items));
        self.active
            .insert(snapshot_id, (Arc::clone(&snapshot), Arc::new(payloads)));
        self.latest_by_user.insert(user.clone(), snapshot_id);

        tracing::info!(
            %snapshot_id,
            %session_id,
            user_id = %user,
            items = snapshot.len(),
            root = %snapshot.merkle_root().short(),
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Look up a snapshot, active or archived
    pub async fn get(&self, snapshot_id: SnapshotId) -> Option<Arc<DataSnapshot>> {
        if let Some(entry) = self.active.get(&snapshot_id) {
            return Some(Arc::clone(&entry.0));
        }
        self.archive.get(&snapshot_id).await.map(|a| a.snapshot)
    }

    /// Where a snapshot lives, if anywhere
    pub fn location(&self, snapshot_id: SnapshotId) -> Option<SnapshotLocation> {
        if self.active.contains_key(&snapshot_id) {
            Some(SnapshotLocation::Active)
        } else if self.archive.contains_key(&snapshot_id) {
            Some(SnapshotLocation::Archived)
        } else {
            None
        }
    }

    /// Most recent snapshot captured for `user` that still exists
    ///
    /// Lookup only; callers never extend the snapshot's lifetime beyond the
    /// returned `Arc`.
    pub async fn latest_for_user(&self, user: &UserId) -> Option<Arc<DataSnapshot>> {
        let id = *self.latest_by_user.get(user)?;
        self.get(id).await
    }

    async fn payloads(&self, snapshot_id: SnapshotId) -> Option<Payloads> {
        if let Some(entry) = self.active.get(&snapshot_id) {
            return Some(Arc::clone(&entry.1));
        }
        self.archive.get(&snapshot_id).await.map(|a| a.payloads)
    }

    /// Compare live data with the snapshot without writing anything
    ///
    /// Every item is examined; read failures are reported per item.
    pub async fn verify(&self, snapshot: &DataSnapshot) -> RestoreReport {
        let user = snapshot.user_id();
        let mut outcomes = Vec::with_capacity(snapshot.len());
        for item in snapshot.items() {
            let outcome = match self.data.read(user, &item.key).await {
                Ok(Some(live)) => match ContentHash::compute_json(&live.payload) {
                    Ok(hash) if hash == item.payload_hash => ItemOutcome::Intact,
                    Ok(_) => ItemOutcome::Corrupted,
                    Err(e) => ItemOutcome::Failed {
                        reason: e.to_string(),
                    },
                },
                Ok(None) => ItemOutcome::Missing,
                Err(e) => ItemOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            outcomes.push((item.key.clone(), outcome));
        }
        RestoreReport {
            snapshot_id: snapshot.snapshot_id(),
            outcomes,
        }
    }

    /// Restore every item that no longer matches the snapshot
    ///
    /// All-or-partial: every item is attempted even after failures, and each
    /// rewrite is read back and re-hashed before it counts as restored.
    ///
    /// # Errors
    /// Returns [`SnapshotError::PayloadsUnavailable`] if the snapshot has
    /// been discarded.
    pub async fn restore(&self, snapshot: &DataSnapshot) -> Result<RestoreReport, SnapshotError> {
        let payloads = self
            .payloads(snapshot.snapshot_id())
            .await
            .ok_or(SnapshotError::PayloadsUnavailable(snapshot.snapshot_id()))?;
        let user = snapshot.user_id();

        let mut outcomes = Vec::with_capacity(snapshot.len());
        for item in snapshot.items() {
            let outcome = self.restore_item(user, item, &payloads).await;
            if let ItemOutcome::Failed { reason } = &outcome {
                tracing::warn!(key = %item.key, %reason, "item restore failed");
            }
            outcomes.push((item.key.clone(), outcome));
        }

        let report = RestoreReport {
            snapshot_id: snapshot.snapshot_id(),
            outcomes,
        };
        tracing::info!(
            snapshot_id = %snapshot.snapshot_id(),
            preserved = report.preserved(),
            restored = report.restored(),
            total = report.total(),
            "snapshot restore finished"
        );
        Ok(report)
    }

    async fn restore_item(
        &self,
        user: &UserId,
        item: &SnapshotItem,
        payloads: &HashMap<ContentHash, serde_json::Value>,
    ) -> ItemOutcome {
        match self.data.read(user, &item.key).await {
            Ok(Some(live)) => {
                if ContentHash::compute_json(&live.payload).ok() == Some(item.payload_hash) {
                    return ItemOutcome::Intact;
                }
            }
            Ok(None) => {}
            Err(e) => {
                return ItemOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }

        let Some(payload) = payloads.get(&item.payload_ref.hash) else {
            return ItemOutcome::Failed {
                reason: format!("payload {} missing from snapshot", item.payload_ref),
            };
        };

        if let Err(e) = self
            .data
            .write(user, StoredItem::new(item.key.clone(), payload.clone()))
            .await
        {
            return ItemOutcome::Failed {
                reason: e.to_string(),
            };
        }

        match self.data.read(user, &item.key).await {
            Ok(Some(back)) if ContentHash::compute_json(&back.payload).ok() == Some(item.payload_hash) => {
                ItemOutcome::Restored
            }
            Ok(_) => ItemOutcome::Failed {
                reason: "read-back does not match snapshot hash".to_string(),
            },
            Err(StoreError::Unreachable(msg) | StoreError::Rejected { reason: msg, .. }) => {
                ItemOutcome::Failed { reason: msg }
            }
        }
    }

    /// Move an active snapshot to cold storage
    ///
    /// # Errors
    /// Returns [`SnapshotError::UnknownSnapshot`] if it is not active
    pub async fn archive(&self, snapshot_id: SnapshotId) -> Result<(), SnapshotError> {
        let (_, (snapshot, payloads)) = self
            .active
            .remove(&snapshot_id)
            .ok_or(SnapshotError::UnknownSnapshot(snapshot_id))?;
        self.archive
            .insert(snapshot_id, ArchivedSnapshot { snapshot, payloads })
            .await;
        tracing::debug!(%snapshot_id, "snapshot archived");
        Ok(())
    }

    /// Drop a snapshot and its payload copies
    pub async fn discard(&self, snapshot_id: SnapshotId) {
        let removed = self.active.remove(&snapshot_id).map(|(_, (s, _))| s);
        let removed = match removed {
            Some(s) => Some(s),
            None => self.archive.remove(&snapshot_id).await.map(|a| a.snapshot),
        };
        if let Some(snapshot) = removed {
            self.latest_by_user
                .remove_if(snapshot.user_id(), |_, latest| *latest == snapshot_id);
            tracing::debug!(%snapshot_id, "snapshot discarded");
        }
    }

    /// Apply the retention policy to a snapshot whose session is done
    ///
    /// # Errors
    /// Returns [`SnapshotError::UnknownSnapshot`] if the snapshot is not active
    pub async fn retire(&self, snapshot_id: SnapshotId) -> Result<(), SnapshotError> {
        match self.retention {
            RetentionPolicy::Archive { .. } => self.archive(snapshot_id).await,
            RetentionPolicy::Discard => {
                if !self.active.contains_key(&snapshot_id) {
                    return Err(SnapshotError::UnknownSnapshot(snapshot_id));
                }
                self.discard(snapshot_id).await;
                Ok(())
            }
        }
    }

    /// Number of snapshots held for in-flight sessions
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDataStore;
    use serde_json::json;

    fn seeded(user: &UserId) -> Arc<InMemoryDataStore> {
        let store = Arc::new(InMemoryDataStore::new());
        store.insert(user, StoredItem::new(ItemKey::new(Category::SessionMemory, "m1"), json!({"text": "hi"})));
        store.insert(user, StoredItem::new(ItemKey::new(Category::SavedReport, "r1"), json!({"rows": 3})));
        store.insert(user, StoredItem::new(ItemKey::new(Category::DashboardLayout, "main"), json!([1, 2])));
        store
    }

    #[tokio::test]
    async fn capture_hashes_every_item() {
        let user = UserId::new("u1");
        let data = seeded(&user);
        let snapshots = SnapshotStore::new(data);

        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();
        assert_eq!(snap.len(), 3);
        assert!(snap.items().iter().all(|i| !i.payload_hash.is_zero()));
        assert!(snap.is_consistent());
        assert_eq!(snapshots.location(snap.snapshot_id()), Some(SnapshotLocation::Active));
    }

    #[tokio::test]
    async fn verify_reports_missing_and_corrupted() {
        let user = UserId::new("u1");
        let data = seeded(&user);
        let snapshots = SnapshotStore::new(data.clone());
        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();

        data.remove(&user, &ItemKey::new(Category::SessionMemory, "m1"));
        data.insert(&user, StoredItem::new(ItemKey::new(Category::SavedReport, "r1"), json!({"rows": 4})));

        let report = snapshots.verify(&snap).await;
        assert_eq!(report.preserved(), 1);
        assert!(report.outcomes.contains(&(
            ItemKey::new(Category::SessionMemory, "m1"),
            ItemOutcome::Missing
        )));
        assert!(report.outcomes.contains(&(
            ItemKey::new(Category::SavedReport, "r1"),
            ItemOutcome::Corrupted
        )));
    }

    #[tokio::test]
    async fn restore_rewrites_drifted_items() {
        let user = UserId::new("u1");
        let data = seeded(&user);
        let snapshots = SnapshotStore::new(data.clone());
        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();

        data.remove(&user, &ItemKey::new(Category::SessionMemory, "m1"));

        let report = snapshots.restore(&snap).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored(), 1);
        assert_eq!(data.item_count(&user), 3);
    }

    #[tokio::test]
    async fn archive_keeps_snapshot_readable() {
        let user = UserId::new("u1");
        let snapshots = SnapshotStore::new(seeded(&user));
        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();

        snapshots.retire(snap.snapshot_id()).await.unwrap();
        assert_eq!(snapshots.active_count(), 0);
        assert_eq!(snapshots.location(snap.snapshot_id()), Some(SnapshotLocation::Archived));
        assert!(snapshots.latest_for_user(&user).await.is_some());
        assert!(snapshots.restore(&snap).await.is_ok());
    }

    #[tokio::test]
    async fn discard_policy_drops_payloads() {
        let user = UserId::new("u1");
        let snapshots = SnapshotStore::with_retention(seeded(&user), RetentionPolicy::Discard);
        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();

        snapshots.retire(snap.snapshot_id()).await.unwrap();
        assert!(snapshots.get(snap.snapshot_id()).await.is_none());
        assert!(snapshots.latest_for_user(&user).await.is_none());
        assert!(matches!(
            snapshots.restore(&snap).await,
            Err(SnapshotError::PayloadsUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn retire_unknown_snapshot_fails() {
        let snapshots = SnapshotStore::new(Arc::new(InMemoryDataStore::new()));
        assert!(matches!(
            snapshots.retire(SnapshotId::new()).await,
            Err(SnapshotError::UnknownSnapshot(_))
        ));
    }
}
