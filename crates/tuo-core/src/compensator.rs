//! Compensator (rollback engine)
//!
//! Undoes a failed session: tier of record, applied transforms, user data
//! (from the snapshot) and the charge. Best effort; every step runs even if
//! an earlier one failed, and the report names exactly what is still wrong.

use crate::accounts::AccountDirectory;
use crate::billing::BillingProvider;
use crate::error::UpgradeError;
use crate::migration::TransformRunner;
use crate::session::{RollbackSummary, UpgradeSession, UpgradeState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tuo_snapshot::{ItemKey, SessionId, SnapshotError, SnapshotStore};

/// What happened to the session's charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundStatus {
    /// No charge was taken
    NotNeeded,
    /// An earlier rollback attempt already refunded it
    AlreadyRefunded,
    /// Refunded by this attempt
    Refunded,
    /// Provider refused or failed
    Failed {
        /// Provider error
        reason: String,
    },
}

/// Result of one rollback attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Session rolled back
    pub session_id: SessionId,
    /// Tier, transforms, data and charge are all back to their prior state
    pub success: bool,
    /// Snapshot items confirmed intact or restored
    pub restored_items: usize,
    /// Snapshot items that could not be restored
    pub unrestored_items: Vec<ItemKey>,
    /// Tier of record reverted
    pub tier_reverted: bool,
    /// Transforms undone
    pub transforms_reverted: usize,
    /// Charge outcome
    pub refund: RefundStatus,
    /// Human-readable problems, one per failed step
    pub issues: Vec<String>,
}

/// Rollback engine
#[derive(Clone)]
pub struct Compensator {
    snapshots: Arc<SnapshotStore>,
    accounts: Arc<dyn AccountDirectory>,
    billing: Arc<dyn BillingProvider>,
    runner: TransformRunner,
}

impl std::fmt::Debug for Compensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensator")
            .field("snapshots", &self.snapshots)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Compensator {
    /// Create a compensator over the shared collaborators
    #[must_use]
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        accounts: Arc<dyn AccountDirectory>,
        billing: Arc<dyn BillingProvider>,
        runner: TransformRunner,
    ) -> Self {
        Self {
            snapshots,
            accounts,
            billing,
            runner,
        }
    }

    /// Roll back a failed session
    ///
    /// Does not change `session.state`; the caller decides between
    /// `rolled_back` and staying `failed` from the report.
    ///
    /// # Errors
    /// Returns [`UpgradeError::NotRollbackable`] unless the session is
    /// `failed` and owns a snapshot
    pub async fn rollback(&self, session: &mut UpgradeSession) -> Result<RollbackReport, UpgradeError> {
        if session.state != UpgradeState::Failed {
            return Err(UpgradeError::NotRollbackable {
                session_id: session.session_id,
                reason: format!("session is {}", session.state),
            });
        }
        let Some(snapshot) = session.snapshot.clone() else {
            return Err(UpgradeError::NotRollbackable {
                session_id: session.session_id,
                reason: "no snapshot was captured".into(),
            });
        };

        let user = session.user_id.clone();
        let mut issues = Vec::new();

        let tier_reverted = match self.accounts.set_plan(&user, session.current_plan).await {
            Ok(()) => true,
            Err(e) => {
                issues.push(format!("tier of record not reverted: {e}"));
                false
            }
        };

        let transform_failures = self.runner.reverse_all(&user, &session.applied_transforms).await;
        for failure in &transform_failures {
            issues.push(format!("{} not reverted: {}", failure.transform, failure.error));
        }
        let transforms_reverted = session.applied_transforms.len() - transform_failures.len();

        let report = match self.snapshots.restore(&snapshot).await {
            Ok(report) => report,
            Err(SnapshotError::PayloadsUnavailable(id)) => {
                issues.push(format!("payloads for snapshot {id} are gone; verified only"));
                self.snapshots.verify(&snapshot).await
            }
            Err(e) => return Err(e.into()),
        };
        let unrestored_items = report.unpreserved_keys();
        if !unrestored_items.is_empty() {
            issues.push(format!("{} item(s) could not be restored", unrestored_items.len()));
        }

        let refund = match (session.charge_id, session.refunded) {
            (None, _) => RefundStatus::NotNeeded,
            (Some(_), true) => RefundStatus::AlreadyRefunded,
            (Some(charge_id), false) => match self.billing.refund(&charge_id).await {
                Ok(()) => {
                    session.refunded = true;
                    RefundStatus::Refunded
                }
                Err(e) => {
                    issues.push(format!("refund failed: {e}"));
                    RefundStatus::Failed { reason: e.to_string() }
                }
            },
        };

        let success = tier_reverted
            && transform_failures.is_empty()
            && unrestored_items.is_empty()
            && !matches!(refund, RefundStatus::Failed { .. });

        session.last_rollback = Some(RollbackSummary {
            success,
            restored_items: report.preserved(),
            unrestored_items: unrestored_items.clone(),
            at: Utc::now(),
        });

        let outcome = if success { "success" } else { "partial" };
        metrics::counter!("tuo_rollbacks_total", "outcome" => outcome).increment(1);
        if success {
            tracing::info!(
                session_id = %session.session_id,
                user_id = %user,
                restored = report.preserved(),
                "rollback complete"
            );
        } else {
            tracing::warn!(
                session_id = %session.session_id,
                user_id = %user,
                unrestored = unrestored_items.len(),
                issues = ?issues,
                "rollback incomplete"
            );
        }

        Ok(RollbackReport {
            session_id: session.session_id,
            success,
            restored_items: report.preserved(),
            unrestored_items,
            tier_reverted,
            transforms_reverted,
            refund,
            issues,
        })
    }
}
