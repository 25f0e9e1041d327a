//! Immutable data snapshots and per-item restore reports

use crate::hash::ContentHash;
use crate::ids::{SessionId, SnapshotId, UserId};
use crate::item::ItemKey;
use crate::merkle::merkle_root;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Reference to a captured payload copy held by the snapshot store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Owning snapshot
    pub snapshot_id: SnapshotId,
    /// Content address of the payload copy
    pub hash: ContentHash,
}

impl Display for PayloadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot://{}/{}", self.snapshot_id, self.hash.short())
    }
}

/// One captured item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    /// Category and identifier
    pub key: ItemKey,
    /// Hash of the payload at capture time
    pub payload_hash: ContentHash,
    /// Where the payload copy lives
    pub payload_ref: PayloadRef,
}

/// Immutable capture of a user's preservation-relevant state
///
/// Fields are private; a snapshot can only be read once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSnapshot {
    snapshot_id: SnapshotId,
    session_id: SessionId,
    user_id: UserId,
    captured_at: DateTime<Utc>,
    items: Vec<SnapshotItem>,
    merkle_root: ContentHash,
}

impl DataSnapshot {
    pub(crate) fn new(
        snapshot_id: SnapshotId,
        session_id: SessionId,
        user_id: UserId,
        items: Vec<SnapshotItem>,
    ) -> Self {
        let merkle_root = Self::root_of(&items);
        Self {
            snapshot_id,
            session_id,
            user_id,
            captured_at: Utc::now(),
            items,
            merkle_root,
        }
    }

    fn root_of(items: &[SnapshotItem]) -> ContentHash {
        let leaves: Vec<ContentHash> = items.iter().map(|i| i.payload_hash).collect();
        merkle_root(&leaves)
    }

    /// Snapshot id
    #[inline]
    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Owning session
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Captured user
    #[inline]
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Capture time
    #[inline]
    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Captured items, in capture order
    #[inline]
    #[must_use]
    pub fn items(&self) -> &[SnapshotItem] {
        &self.items
    }

    /// Number of captured items
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the user had no preservation-relevant data
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merkle root recorded at capture
    #[inline]
    #[must_use]
    pub fn merkle_root(&self) -> ContentHash {
        self.merkle_root
    }

    /// Recompute the Merkle root and compare with the recorded one
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        Self::root_of(&self.items) == self.merkle_root
    }
}

/// What happened to one snapshot item during verify or restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Live payload already matched the snapshot
    Intact,
    /// Live payload was missing or different and has been rewritten
    Restored,
    /// Live item absent (verify only)
    Missing,
    /// Live payload hash differs (verify only)
    Corrupted,
    /// Read, write or read-back check failed
    Failed {
        /// Failure description
        reason: String,
    },
}

impl ItemOutcome {
    /// Item matches the snapshot after the pass
    #[inline]
    #[must_use]
    pub fn is_preserved(&self) -> bool {
        matches!(self, Self::Intact | Self::Restored)
    }
}

/// Per-item result of a verify or restore pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Snapshot the pass ran against
    pub snapshot_id: SnapshotId,
    /// Outcome per item, in snapshot order
    pub outcomes: Vec<(ItemKey, ItemOutcome)>,
}

impl RestoreReport {
    /// Total items examined
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Items intact or restored
    #[must_use]
    pub fn preserved(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_preserved()).count()
    }

    /// Items rewritten by this pass
    #[must_use]
    pub fn restored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ItemOutcome::Restored))
            .count()
    }

    /// Keys of items that do not match the snapshot
    #[must_use]
    pub fn unpreserved_keys(&self) -> Vec<ItemKey> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_preserved())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every item matches
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.preserved() == self.total()
    }

    /// Integrity percentage, rounded to the nearest integer
    #[inline]
    #[must_use]
    pub fn integrity(&self) -> u8 {
        integrity_percent(self.preserved(), self.total())
    }
}

/// `preserved / total * 100`, rounded to the nearest integer
///
/// An empty snapshot counts as fully preserved.
#[must_use]
pub fn integrity_percent(preserved: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let preserved = preserved.min(total);
    // Integer round-half-up: (200p + t) / 2t
    let pct = (preserved * 200 + total) / (total * 2);
    u8::try_from(pct).unwrap_or(100)
}

/// What happens to a snapshot once its session no longer needs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Drop snapshot and payload copies immediately
    Discard,
    /// Keep in cold storage for `ttl_secs`, then drop
    Archive {
        /// Time to live in seconds
        ttl_secs: u64,
    },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Archive {
            ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Category;
    use proptest::prelude::*;

    fn item(id: &str, data: &[u8]) -> SnapshotItem {
        let hash = ContentHash::compute(data);
        SnapshotItem {
            key: ItemKey::new(Category::SessionMemory, id),
            payload_hash: hash,
            payload_ref: PayloadRef {
                snapshot_id: SnapshotId::new(),
                hash,
            },
        }
    }

    #[test]
    fn snapshot_records_consistent_root() {
        let snap = DataSnapshot::new(
            SnapshotId::new(),
            SessionId::new(),
            UserId::new("u"),
            vec![item("a", b"1"), item("b", b"2")],
        );
        assert_eq!(snap.len(), 2);
        assert!(snap.is_consistent());
        assert!(!snap.merkle_root().is_zero());
    }

    #[test]
    fn integrity_rounds_to_nearest() {
        assert_eq!(integrity_percent(48, 50), 96);
        assert_eq!(integrity_percent(2, 3), 67);
        assert_eq!(integrity_percent(1, 3), 33);
        assert_eq!(integrity_percent(1, 200), 1);
        assert_eq!(integrity_percent(0, 0), 100);
    }

    #[test]
    fn report_counts() {
        let report = RestoreReport {
            snapshot_id: SnapshotId::new(),
            outcomes: vec![
                (ItemKey::new(Category::SavedReport, "a"), ItemOutcome::Intact),
                (ItemKey::new(Category::SavedReport, "b"), ItemOutcome::Restored),
                (
                    ItemKey::new(Category::SavedReport, "c"),
                    ItemOutcome::Failed { reason: "rejected".into() },
                ),
                (ItemKey::new(Category::SavedReport, "d"), ItemOutcome::Missing),
            ],
        };
        assert_eq!(report.total(), 4);
        assert_eq!(report.preserved(), 2);
        assert_eq!(report.restored(), 1);
        assert_eq!(report.integrity(), 50);
        assert!(!report.is_complete());
        assert_eq!(report.unpreserved_keys().len(), 2);
    }

    #[test]
    fn retention_serde_is_tagged() {
        let json = serde_json::to_string(&RetentionPolicy::Archive { ttl_secs: 60 }).unwrap();
        assert_eq!(json, r#"{"policy":"archive","ttl_secs":60}"#);
    }

    proptest! {
        #[test]
        fn prop_integrity_bounded_and_monotone(total in 1usize..500, a in 0usize..500, b in 0usize..500) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo = lo.min(total);
            let hi = hi.min(total);
            prop_assert!(integrity_percent(hi, total) <= 100);
            prop_assert!(integrity_percent(lo, total) <= integrity_percent(hi, total));
            prop_assert_eq!(integrity_percent(total, total), 100);
        }
    }
}
