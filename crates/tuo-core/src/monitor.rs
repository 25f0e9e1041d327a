//! Preservation Monitor
//!
//! Periodically compares a user's live data with their most recent snapshot
//! and exposes the result as a [`PreservationStatus`]. Read-only: it looks
//! snapshots up by user and never creates, extends or deletes one.
//!
//! After a session has completed (its snapshot is archived) any integrity
//! below 100% is published as a [`DriftAlert`]. Alerts only notify.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tuo_snapshot::{ItemOutcome, SnapshotId, SnapshotLocation, SnapshotStore, UserId};

/// Integrity view derived from live data and the reference snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservationStatus {
    /// Watched user
    pub user_id: Option<UserId>,
    /// Reference snapshot
    pub snapshot_id: Option<SnapshotId>,
    /// Items in the snapshot
    pub total_items: usize,
    /// Items present and unmodified
    pub preserved_items: usize,
    /// `preserved / total * 100`, rounded
    pub data_integrity: u8,
    /// One line per problem
    pub issues: Vec<String>,
    /// When this view was computed
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for PreservationStatus {
    fn default() -> Self {
        Self {
            user_id: None,
            snapshot_id: None,
            total_items: 0,
            preserved_items: 0,
            data_integrity: 100,
            issues: Vec::new(),
            last_check: None,
        }
    }
}

/// Integrity loss detected after completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftAlert {
    /// Affected user
    pub user_id: UserId,
    /// Snapshot the data drifted from
    pub snapshot_id: SnapshotId,
    /// Integrity at detection
    pub data_integrity: u8,
    /// Problems found
    pub issues: Vec<String>,
    /// Detection time
    pub detected_at: DateTime<Utc>,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic integrity checker
pub struct PreservationMonitor {
    snapshots: Arc<SnapshotStore>,
    interval: Duration,
    status: Arc<RwLock<PreservationStatus>>,
    alerts: broadcast::Sender<DriftAlert>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for PreservationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreservationMonitor")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PreservationMonitor {
    /// Create a stopped monitor polling every `interval`
    #[must_use]
    pub fn new(snapshots: Arc<SnapshotStore>, interval: Duration) -> Self {
        let (alerts, _) = broadcast::channel(16);
        Self {
            snapshots,
            interval,
            status: Arc::new(RwLock::new(PreservationStatus::default())),
            alerts,
            running: Mutex::new(None),
        }
    }

    /// Start polling for `user`, replacing any running poll loop
    pub fn start(&self, user: UserId) {
        let (stop, mut stop_rx) = watch::channel(false);
        let snapshots = Arc::clone(&self.snapshots);
        let status = Arc::clone(&self.status);
        let alerts = self.alerts.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let next = check(&snapshots, &user, &alerts).await;
                        *status.write() = next;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(user_id = %user, "preservation monitor stopped");
        });

        if let Some(previous) = self.running.lock().replace(Running { stop, handle }) {
            let _ = previous.stop.send(true);
        }
    }

    /// Stop polling and wait for the loop to exit
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { stop, handle }) = running {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "preservation monitor task ended abnormally");
            }
        }
    }

    /// Poll loop active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Last computed status
    #[must_use]
    pub fn status(&self) -> PreservationStatus {
        self.status.read().clone()
    }

    /// Compute status for `user` now and store it as the latest
    pub async fn check_now(&self, user: &UserId) -> PreservationStatus {
        let next = check(&self.snapshots, user, &self.alerts).await;
        *self.status.write() = next.clone();
        next
    }

    /// Subscribe to drift alerts
    #[must_use]
    pub fn alerts(&self) -> broadcast::Receiver<DriftAlert> {
        self.alerts.subscribe()
    }
}

impl Drop for PreservationMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop.send(true);
        }
    }
}

async fn check(
    snapshots: &SnapshotStore,
    user: &UserId,
    alerts: &broadcast::Sender<DriftAlert>,
) -> PreservationStatus {
    let now = Utc::now();
    let Some(snapshot) = snapshots.latest_for_user(user).await else {
        return PreservationStatus {
            user_id: Some(user.clone()),
            issues: vec!["no snapshot available".to_string()],
            last_check: Some(now),
            ..PreservationStatus::default()
        };
    };

    let report = snapshots.verify(&snapshot).await;
    let issues: Vec<String> = report
        .outcomes
        .iter()
        .filter_map(|(key, outcome)| match outcome {
            ItemOutcome::Missing => Some(format!("{key} is missing")),
            ItemOutcome::Corrupted => Some(format!("{key} was modified")),
            ItemOutcome::Failed { reason } => Some(format!("{key} could not be checked: {reason}")),
            ItemOutcome::Intact | ItemOutcome::Restored => None,
        })
        .collect();

    let status = PreservationStatus {
        user_id: Some(user.clone()),
        snapshot_id: Some(snapshot.snapshot_id()),
        total_items: report.total(),
        preserved_items: report.preserved(),
        data_integrity: report.integrity(),
        issues,
        last_check: Some(now),
    };

    let settled = snapshots.location(snapshot.snapshot_id()) == Some(SnapshotLocation::Archived);
    if settled && status.data_integrity < 100 {
        tracing::warn!(
            user_id = %user,
            snapshot_id = %snapshot.snapshot_id(),
            integrity = status.data_integrity,
            "post-upgrade data drift detected"
        );
        let _ = alerts.send(DriftAlert {
            user_id: user.clone(),
            snapshot_id: snapshot.snapshot_id(),
            data_integrity: status.data_integrity,
            issues: status.issues.clone(),
            detected_at: now,
        });
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tuo_snapshot::{Category, InMemoryDataStore, ItemKey, SessionId, StoredItem};

    fn seeded(user: &UserId, n: usize) -> Arc<InMemoryDataStore> {
        let data = Arc::new(InMemoryDataStore::new());
        for i in 0..n {
            data.insert(
                user,
                StoredItem::new(ItemKey::new(Category::SessionMemory, format!("m{i}")), json!(i)),
            );
        }
        data
    }

    #[tokio::test]
    async fn status_without_snapshot() {
        let snapshots = Arc::new(SnapshotStore::new(Arc::new(InMemoryDataStore::new())));
        let monitor = PreservationMonitor::new(snapshots, Duration::from_millis(10));
        let status = monitor.check_now(&UserId::new("u1")).await;
        assert_eq!(status.total_items, 0);
        assert_eq!(status.data_integrity, 100);
        assert_eq!(status.issues, vec!["no snapshot available".to_string()]);
    }

    #[tokio::test]
    async fn integrity_tracks_missing_items() {
        let user = UserId::new("u1");
        let data = seeded(&user, 4);
        let snapshots = Arc::new(SnapshotStore::new(data.clone()));
        snapshots.capture(&user, SessionId::new()).await.unwrap();
        let monitor = PreservationMonitor::new(snapshots, Duration::from_millis(10));

        data.remove(&user, &ItemKey::new(Category::SessionMemory, "m0"));
        let status = monitor.check_now(&user).await;
        assert_eq!(status.preserved_items, 3);
        assert_eq!(status.data_integrity, 75);
        assert_eq!(status.issues.len(), 1);
    }

    #[tokio::test]
    async fn drift_alert_only_after_completion() {
        let user = UserId::new("u1");
        let data = seeded(&user, 2);
        let snapshots = Arc::new(SnapshotStore::new(data.clone()));
        let snap = snapshots.capture(&user, SessionId::new()).await.unwrap();
        let monitor = PreservationMonitor::new(Arc::clone(&snapshots), Duration::from_millis(10));
        let mut alerts = monitor.alerts();

        data.remove(&user, &ItemKey::new(Category::SessionMemory, "m1"));
        monitor.check_now(&user).await;
        assert!(alerts.try_recv().is_err());

        snapshots.retire(snap.snapshot_id()).await.unwrap();
        monitor.check_now(&user).await;
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.data_integrity, 50);
        assert_eq!(alert.snapshot_id, snap.snapshot_id());
    }

    #[tokio::test]
    async fn poll_loop_updates_status_and_stops() {
        let user = UserId::new("u1");
        let data = seeded(&user, 3);
        let snapshots = Arc::new(SnapshotStore::new(data));
        snapshots.capture(&user, SessionId::new()).await.unwrap();
        let monitor = PreservationMonitor::new(snapshots, Duration::from_millis(5));

        monitor.start(user.clone());
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = monitor.status();
        assert_eq!(status.total_items, 3);
        assert!(status.last_check.is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
