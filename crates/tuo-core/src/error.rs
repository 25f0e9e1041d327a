//! Error types for the upgrade orchestrator
//!
//! Provides the error taxonomy surfaced to callers:
//! - Validation failures (session never created)
//! - Concurrency guards (upgrade in progress, manual review pending)
//! - Collaborator failures (billing, accounts, data store, snapshots)
//! - Lifecycle misuse (cancel / retry / rollback in the wrong state)
//!
//! Internally every step failure collapses into a [`FailureDescriptor`],
//! which is the only failure shape stored on a session.

use crate::session::UpgradeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use tuo_snapshot::{SessionId, SnapshotError, StoreError, UserId};
use tuo_tiers::{BillingInterval, Tier, TierConfigError};

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    /// Request rejected before a session was created
    #[error("invalid upgrade request: {0}")]
    Validation(#[from] ValidationError),

    /// Another session for the same user is still active
    #[error("upgrade already in progress for user {user_id}")]
    UpgradeInProgress {
        /// User with the active session
        user_id: UserId,
    },

    /// The user's last rollback was incomplete and awaits review
    #[error("user {user_id} has session {session_id} awaiting manual review")]
    ManualReviewPending {
        /// User under review
        user_id: UserId,
        /// Session that needs review
        session_id: SessionId,
    },

    /// Unknown session id
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Rollback requested for a session that cannot be rolled back
    #[error("session {session_id} cannot be rolled back: {reason}")]
    NotRollbackable {
        /// Session
        session_id: SessionId,
        /// Why
        reason: String,
    },

    /// A rollback for this session is already running
    #[error("rollback already running for session {0}")]
    RollbackInProgress(SessionId),

    /// Retry requested for a session that is not retryable yet
    #[error("session {session_id} in state {state} cannot be retried")]
    NotRetryable {
        /// Session
        session_id: SessionId,
        /// State at the time of the request
        state: UpgradeState,
    },

    /// Cancellation requested after the irreversible billing step
    #[error("session {session_id} cannot be cancelled in state {state}")]
    CancellationRejected {
        /// Session
        session_id: SessionId,
        /// State at the time of the request
        state: UpgradeState,
    },

    /// State machine violation
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: UpgradeState,
        /// Requested state
        to: UpgradeState,
    },

    /// Capability table problem
    #[error("configuration error: {0}")]
    Config(#[from] TierConfigError),

    /// Orchestrator configuration file problem
    #[error("invalid orchestrator configuration: {0}")]
    InvalidConfig(String),

    /// Snapshot store failure
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Data store failure
    #[error("data store error: {0}")]
    Store(#[from] StoreError),

    /// Billing collaborator failure
    #[error("billing error: {0}")]
    Billing(#[from] BillingError),

    /// Account directory failure
    #[error("account error: {0}")]
    Account(#[from] AccountError),

    /// Session was cancelled by the caller
    #[error("upgrade cancelled")]
    Cancelled,

    /// Background task failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl UpgradeError {
    /// Machine-readable failure kind
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::InvalidConfig(_) => FailureKind::Validation,
            Self::Snapshot(SnapshotError::CaptureFailed { .. }) => FailureKind::Capture,
            Self::Snapshot(_) | Self::Store(_) => FailureKind::Restore,
            Self::Billing(_) => FailureKind::Billing,
            Self::Account(_) => FailureKind::Finalize,
            Self::Cancelled => FailureKind::Cancelled,
            Self::ManualReviewPending { .. } => FailureKind::RollbackPartial,
            Self::UpgradeInProgress { .. }
            | Self::SessionNotFound(_)
            | Self::NotRollbackable { .. }
            | Self::RollbackInProgress(_)
            | Self::NotRetryable { .. }
            | Self::CancellationRejected { .. }
            | Self::IllegalTransition { .. }
            | Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Check if the same request may succeed later without intervention
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpgradeInProgress { .. }
                | Self::RollbackInProgress(_)
                | Self::Store(StoreError::Unreachable(_))
                | Self::Billing(BillingError::Unavailable(_))
        )
    }

    /// Check if the error needs an operator
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::ManualReviewPending { .. })
    }
}

/// Request validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Target tier equals the current tier
    #[error("user is already on the {0} tier")]
    SameTier(Tier),

    /// Target tier does not bill on the requested interval
    #[error("tier {tier} does not support {interval} billing")]
    UnsupportedInterval {
        /// Target tier
        tier: Tier,
        /// Requested interval
        interval: BillingInterval,
    },

    /// Empty user id
    #[error("user id must not be empty")]
    EmptyUserId,
}

/// Billing collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// Provider unreachable; no money moved
    #[error("billing provider unavailable: {0}")]
    Unavailable(String),

    /// Refund refused by the provider
    #[error("refund rejected for charge {charge_id}: {reason}")]
    RefundRejected {
        /// Charge that could not be refunded
        charge_id: String,
        /// Provider reason
        reason: String,
    },
}

/// Account directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    /// Directory unreachable
    #[error("account directory unavailable: {0}")]
    Unavailable(String),
}

/// Machine-readable failure classification exposed to UIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad request input
    Validation,
    /// Snapshot could not be captured
    Capture,
    /// Charge declined or billing unavailable
    Billing,
    /// A data transform failed after bounded retries
    Migration,
    /// Snapshot verification could not be satisfied
    Restore,
    /// Tier of record could not be committed
    Finalize,
    /// Caller cancelled before billing
    Cancelled,
    /// Rollback left items unrestored
    RollbackPartial,
    /// Orchestrator fault
    Internal,
}

impl FailureKind {
    /// Stable label (metrics, logs)
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Capture => "capture",
            Self::Billing => "billing",
            Self::Migration => "migration",
            Self::Restore => "restore",
            Self::Finalize => "finalize",
            Self::Cancelled => "cancelled",
            Self::RollbackPartial => "rollback_partial",
            Self::Internal => "internal",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on a session
///
/// Never carries a backtrace: only a kind, the step it happened in and a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    /// Classification
    pub kind: FailureKind,
    /// State the session was in when it failed
    pub step: UpgradeState,
    /// Human-readable message
    pub message: String,
    /// When the failure was recorded
    pub occurred_at: DateTime<Utc>,
}

impl FailureDescriptor {
    /// Create a descriptor stamped now
    #[must_use]
    pub fn new(kind: FailureKind, step: UpgradeState, message: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}
