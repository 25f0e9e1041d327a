//! TUO Snapshot - Content-addressed user data snapshots
//!
//! Everything the orchestrator needs to take a consistent copy of a user's
//! preservation-relevant data before a risky tier change, and to prove
//! afterwards that the data survived:
//!
//! - [`DataStore`]: the per-category read/write collaborator
//! - [`SnapshotStore`]: `capture` / `verify` / `restore` / `retire` / `discard`
//! - [`DataSnapshot`]: immutable, hashed, Merkle-rooted capture
//! - [`RestoreReport`]: per-item outcome used to compute integrity scores

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod hash;
pub mod ids;
pub mod item;
pub mod merkle;
pub mod snapshot;
pub mod snapshot_store;
pub mod store;

pub use error::{SnapshotError, StoreError};
pub use hash::{ContentHash, HashError};
pub use ids::{SessionId, SnapshotId, UserId};
pub use item::{Category, ItemKey, StoredItem};
pub use snapshot::{
    integrity_percent, DataSnapshot, ItemOutcome, PayloadRef, RestoreReport, RetentionPolicy,
    SnapshotItem,
};
pub use snapshot_store::{SnapshotLocation, SnapshotStore};
pub use store::{DataStore, FeatureState, InMemoryDataStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
