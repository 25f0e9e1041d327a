//! TUO Core - Tier upgrade orchestration
//!
//! Moves a user between subscription tiers as a saga:
//!
//! ```text
//! starting -> backing_up -> upgrading -> migrating -> restoring -> finalizing -> completed
//!     any active state -> failed -> rolled_back
//! ```
//!
//! - [`MigrationExecutor`]: registers, drives, cancels and retries sessions
//! - [`Compensator`]: reverts tier, transforms, data and charge after a failure
//! - [`PreservationMonitor`]: live integrity score against the latest snapshot
//! - [`ProgressHub`]: per-session progress channels plus global observers
//! - [`AuditLog`]: hash-chained record of every progress event
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tuo_core::prelude::*;
//!
//! # async fn run() -> Result<(), UpgradeError> {
//! let executor = MigrationExecutor::new(
//!     OrchestratorConfig::default(),
//!     TierResolver::builtin(),
//!     Collaborators {
//!         data: Arc::new(InMemoryDataStore::new()),
//!         billing: Arc::new(SimulatedBilling::new()),
//!         accounts: Arc::new(InMemoryAccounts::new()),
//!     },
//! );
//! let session = executor
//!     .execute(UpgradeRequest::new("user-1", Tier::Professional, BillingInterval::Monthly))
//!     .await?;
//! assert_eq!(session.state, UpgradeState::Completed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod accounts;
pub mod audit;
pub mod billing;
pub mod compensator;
pub mod config;
pub mod error;
pub mod executor;
pub mod migration;
pub mod monitor;
pub mod progress;
pub mod session;
pub mod state_machine;

pub use accounts::{AccountDirectory, InMemoryAccounts};
pub use audit::{verify_chain, AuditEntry, AuditError, AuditLog};
pub use billing::{BillingProvider, ChargeId, ChargeReceipt, LedgerEntry, SimulatedBilling};
pub use compensator::{Compensator, RefundStatus, RollbackReport};
pub use config::OrchestratorConfig;
pub use error::{
    AccountError, BillingError, FailureDescriptor, FailureKind, UpgradeError, ValidationError,
};
pub use executor::{Collaborators, MigrationExecutor, UpgradeHandle};
pub use migration::{MigrationOutcome, TransformFailure, TransformRunner};
pub use monitor::{DriftAlert, PreservationMonitor, PreservationStatus};
pub use progress::{ProgressEvent, ProgressHub, ProgressObserver};
pub use session::{
    AccountPlan, AppliedTransform, RollbackSummary, StateChange, Undo, UpgradeRequest,
    UpgradeSession, UpgradeState,
};
pub use state_machine::{allowed_transitions, validate_transition};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AccountDirectory, AccountPlan, AuditLog, BillingProvider, Collaborators, FailureKind,
        InMemoryAccounts, MigrationExecutor, OrchestratorConfig, PreservationMonitor,
        ProgressEvent, RollbackReport, SimulatedBilling, UpgradeError, UpgradeRequest,
        UpgradeSession, UpgradeState,
    };
    pub use tuo_snapshot::{DataStore, InMemoryDataStore, SessionId, UserId};
    pub use tuo_tiers::{BillingInterval, Tier, TierResolver};
}
