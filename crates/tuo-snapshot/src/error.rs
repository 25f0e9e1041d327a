//! Error types for the data store collaborator and the snapshot store

use crate::hash::HashError;
use crate::ids::{SnapshotId, UserId};
use crate::item::ItemKey;

/// Errors reported by a [`DataStore`](crate::store::DataStore) implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backing store cannot be reached
    #[error("data store unreachable: {0}")]
    Unreachable(String),

    /// Write refused for a specific item
    #[error("write rejected for {key}: {reason}")]
    Rejected {
        /// Item the write targeted
        key: ItemKey,
        /// Store-supplied reason
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Snapshot store errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Capture could not enumerate the user's data
    #[error("snapshot capture failed for user {user_id}: {source}")]
    CaptureFailed {
        /// User whose data was being captured
        user_id: UserId,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Snapshot id not known (never captured, or discarded)
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(SnapshotId),

    /// Payload copies are gone so the snapshot can only be verified, not restored
    #[error("payloads for snapshot {0} are no longer available")]
    PayloadsUnavailable(SnapshotId),

    /// Payload hashing failed
    #[error("payload hashing failed: {0}")]
    Hash(#[from] HashError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Category;

    #[test]
    fn unreachable_is_transient() {
        assert!(StoreError::Unreachable("down".into()).is_transient());
        let rejected = StoreError::Rejected {
            key: ItemKey::new(Category::SavedReport, "r1"),
            reason: "read-only".into(),
        };
        assert!(!rejected.is_transient());
        assert!(rejected.to_string().contains("saved_report/r1"));
    }
}
