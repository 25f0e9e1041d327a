//! Upgrade sessions
//!
//! An [`UpgradeSession`] is one attempt to move a user between tiers. It is
//! the single source of truth for state and progress; everything the UI
//! renders is derived from it.

use crate::billing::ChargeId;
use crate::error::FailureDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tuo_snapshot::{DataSnapshot, FeatureState, ItemKey, SessionId, SnapshotId, UserId};
use tuo_tiers::{BillingInterval, DataTransform, FeatureId, Limits, Tier, TierDiff};

/// Upgrade session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    /// Inputs validated, session registered
    Starting,
    /// Capturing the data snapshot
    BackingUp,
    /// Charging for the new tier
    Upgrading,
    /// Applying data transforms
    Migrating,
    /// Verifying live data against the snapshot
    Restoring,
    /// Committing the tier of record
    Finalizing,
    /// Terminal success
    Completed,
    /// Step failed; compensation pending or partial
    Failed,
    /// Compensation confirmed
    RolledBack,
}

impl UpgradeState {
    /// Happy-path order
    pub const HAPPY_PATH: [UpgradeState; 7] = [
        UpgradeState::Starting,
        UpgradeState::BackingUp,
        UpgradeState::Upgrading,
        UpgradeState::Migrating,
        UpgradeState::Restoring,
        UpgradeState::Finalizing,
        UpgradeState::Completed,
    ];

    /// Fixed progress reported on entering this state
    ///
    /// `None` for failure states, which keep the last reported value.
    #[inline]
    #[must_use]
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Starting => Some(5),
            Self::BackingUp => Some(15),
            Self::Upgrading => Some(35),
            Self::Migrating => Some(60),
            Self::Restoring => Some(80),
            Self::Finalizing => Some(95),
            Self::Completed => Some(100),
            Self::Failed | Self::RolledBack => None,
        }
    }

    /// Session is still running a step
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    /// Cancellation still allowed (nothing irreversible yet)
    #[inline]
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Starting | Self::BackingUp)
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::BackingUp => "backing_up",
            Self::Upgrading => "upgrading",
            Self::Migrating => "migrating",
            Self::Restoring => "restoring",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Default progress message for this state
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Starting => "Preparing your upgrade",
            Self::BackingUp => "Backing up your data",
            Self::Upgrading => "Activating your new plan",
            Self::Migrating => "Enabling new features",
            Self::Restoring => "Verifying your data",
            Self::Finalizing => "Finishing up",
            Self::Completed => "Upgrade complete",
            Self::Failed => "Upgrade failed",
            Self::RolledBack => "Upgrade rolled back",
        }
    }
}

impl Display for UpgradeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller request to change tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// User to upgrade
    pub user_id: UserId,
    /// Tier to move to
    pub target_tier: Tier,
    /// Billing interval for the new tier
    pub billing_interval: BillingInterval,
}

impl UpgradeRequest {
    /// Create a request
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, target_tier: Tier, billing_interval: BillingInterval) -> Self {
        Self {
            user_id: user_id.into(),
            target_tier,
            billing_interval,
        }
    }
}

/// Tier of record for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPlan {
    /// Tier
    pub tier: Tier,
    /// Billing interval
    pub interval: BillingInterval,
}

impl AccountPlan {
    /// Create a plan
    #[inline]
    #[must_use]
    pub fn new(tier: Tier, interval: BillingInterval) -> Self {
        Self { tier, interval }
    }
}

impl Default for AccountPlan {
    fn default() -> Self {
        Self::new(Tier::Free, BillingInterval::Monthly)
    }
}

/// Store write that undoes an applied transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Undo {
    /// Put a feature namespace back in its prior state
    RestoreFeature {
        /// Feature
        feature: FeatureId,
        /// State before the transform
        state: FeatureState,
    },
    /// Put the prior limits back
    RestoreLimits {
        /// Limits before the transform
        limits: Option<Limits>,
    },
}

/// A transform that took effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTransform {
    /// What was applied
    pub transform: DataTransform,
    /// How to revert it
    pub undo: Undo,
}

/// Recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State entered
    pub state: UpgradeState,
    /// When
    pub at: DateTime<Utc>,
}

/// Outcome of the last compensation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    /// Everything reverted and every item restored
    pub success: bool,
    /// Items confirmed restored or intact
    pub restored_items: usize,
    /// Items that could not be restored
    pub unrestored_items: Vec<ItemKey>,
    /// When the attempt finished
    pub at: DateTime<Utc>,
}

/// One attempt to move a user from one tier to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeSession {
    /// Session id
    pub session_id: SessionId,
    /// User
    pub user_id: UserId,
    /// Plan of record when the session started
    pub current_plan: AccountPlan,
    /// Requested tier
    pub target_tier: Tier,
    /// Requested billing interval
    pub billing_interval: BillingInterval,
    /// Resolver output for this change
    pub diff: TierDiff,
    /// Current state
    pub state: UpgradeState,
    /// Last reported progress
    pub progress_percent: u8,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Set on completed, failed or rolled_back
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure, if any
    pub error: Option<FailureDescriptor>,
    /// Every state entered, in order
    pub history: Vec<StateChange>,
    /// Snapshot captured in `backing_up`
    pub snapshot_id: Option<SnapshotId>,
    #[serde(skip)]
    pub(crate) snapshot: Option<Arc<DataSnapshot>>,
    /// Charge taken in `upgrading`
    pub charge_id: Option<ChargeId>,
    /// `charge` was invoked (successfully or not)
    pub charge_attempted: bool,
    /// Charge reversed by the compensator
    pub refunded: bool,
    /// Transforms that took effect, in application order
    pub applied_transforms: Vec<AppliedTransform>,
    /// Last compensation left items unrestored
    pub needs_manual_review: bool,
    /// Caller asked to cancel
    pub cancel_requested: bool,
    /// Last compensation outcome
    pub last_rollback: Option<RollbackSummary>,
}

impl UpgradeSession {
    pub(crate) fn new(
        session_id: SessionId,
        request: &UpgradeRequest,
        current_plan: AccountPlan,
        diff: TierDiff,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: request.user_id.clone(),
            current_plan,
            target_tier: request.target_tier,
            billing_interval: request.billing_interval,
            diff,
            state: UpgradeState::Starting,
            progress_percent: UpgradeState::Starting.progress().unwrap_or(0),
            started_at: now,
            completed_at: None,
            error: None,
            history: vec![StateChange {
                state: UpgradeState::Starting,
                at: now,
            }],
            snapshot_id: None,
            snapshot: None,
            charge_id: None,
            charge_attempted: false,
            refunded: false,
            applied_transforms: Vec::new(),
            needs_manual_review: false,
            cancel_requested: false,
            last_rollback: None,
        }
    }

    /// Tier of record when the session started
    #[inline]
    #[must_use]
    pub fn current_tier(&self) -> Tier {
        self.current_plan.tier
    }

    /// Snapshot owned by this session
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Option<&Arc<DataSnapshot>> {
        self.snapshot.as_ref()
    }

    /// Sequence of states entered
    #[must_use]
    pub fn states(&self) -> Vec<UpgradeState> {
        self.history.iter().map(|c| c.state).collect()
    }

    /// Nothing the compensator would need to undo has happened
    #[must_use]
    pub fn nothing_irreversible(&self) -> bool {
        self.charge_id.is_none() && self.applied_transforms.is_empty()
    }

    /// Failed session whose compensation is confirmed or unnecessary
    #[must_use]
    pub fn is_safe(&self) -> bool {
        match self.state {
            UpgradeState::RolledBack => true,
            UpgradeState::Failed => !self.needs_manual_review && self.nothing_irreversible(),
            _ => false,
        }
    }

    /// A new attempt for the same request may be started from this session
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_safe()
    }

    /// Compensator preconditions hold
    #[must_use]
    pub fn can_rollback(&self) -> bool {
        self.state == UpgradeState::Failed && self.snapshot.is_some()
    }

    /// Message safe to show the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.state {
            UpgradeState::Completed => format!("You are now on the {} plan.", self.target_tier),
            UpgradeState::Failed | UpgradeState::RolledBack if self.is_safe() => {
                "Your data is safe and unchanged.".to_string()
            }
            UpgradeState::Failed | UpgradeState::RolledBack => format!(
                "We could not confirm that all of your data was restored. \
                 Please contact support and quote reference {}.",
                self.session_id
            ),
            state => state.message().to_string(),
        }
    }

    pub(crate) fn enter(&mut self, state: UpgradeState) {
        let now = Utc::now();
        self.state = state;
        if let Some(p) = state.progress() {
            self.progress_percent = self.progress_percent.max(p);
        }
        if !state.is_active() {
            self.completed_at = Some(now);
        }
        self.history.push(StateChange { state, at: now });
    }
}
