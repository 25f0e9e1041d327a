//! Migration Executor
//!
//! Drives one [`UpgradeSession`] per user through
//! `starting -> backing_up -> upgrading -> migrating -> restoring -> finalizing -> completed`,
//! hands failures to the [`Compensator`] and reports every state change to
//! progress subscribers.
//!
//! Sessions are addressed by [`SessionId`]; the executor holds no per-user
//! state beyond the single-session guard and the manual-review list.
//! Finished sessions stay addressable for
//! [`session_retention_secs`](OrchestratorConfig::session_retention_secs);
//! sessions awaiting manual review are kept until they are resolved.

use crate::accounts::AccountDirectory;
use crate::billing::BillingProvider;
use crate::compensator::{Compensator, RollbackReport};
use crate::config::OrchestratorConfig;
use crate::error::{FailureDescriptor, FailureKind, UpgradeError, ValidationError};
use crate::migration::TransformRunner;
use crate::monitor::PreservationMonitor;
use crate::progress::{ProgressEvent, ProgressHub, ProgressObserver};
use crate::session::{AccountPlan, UpgradeRequest, UpgradeSession, UpgradeState};
use crate::state_machine::validate_transition;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tuo_snapshot::{DataStore, SessionId, SnapshotStore, UserId};
use tuo_tiers::{TierConfigError, TierDiff, TierResolver};

type SessionSlot = Arc<RwLock<UpgradeSession>>;

/// External collaborators the executor consumes
#[derive(Clone)]
pub struct Collaborators {
    /// User data
    pub data: Arc<dyn DataStore>,
    /// Money movement
    pub billing: Arc<dyn BillingProvider>,
    /// Tier of record
    pub accounts: Arc<dyn AccountDirectory>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// A running session started by [`MigrationExecutor::start_upgrade`]
#[derive(Debug)]
pub struct UpgradeHandle {
    /// Session id
    pub session_id: SessionId,
    /// Progress receiver attached before the first event was emitted
    pub events: broadcast::Receiver<ProgressEvent>,
    join: JoinHandle<UpgradeSession>,
}

impl UpgradeHandle {
    /// Wait for the session to stop running and return its final view
    ///
    /// # Errors
    /// Returns [`UpgradeError::Internal`] if the driving task panicked
    pub async fn wait(self) -> Result<UpgradeSession, UpgradeError> {
        self.join
            .await
            .map_err(|e| UpgradeError::Internal(format!("upgrade task failed: {e}")))
    }
}

/// Step failure before it is recorded on the session
#[derive(Debug)]
struct StepFailure {
    kind: FailureKind,
    message: String,
}

impl StepFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_error(err: impl Into<UpgradeError>) -> Self {
        let err = err.into();
        Self::new(err.kind(), err.to_string())
    }
}

struct Inner {
    config: OrchestratorConfig,
    resolver: TierResolver,
    billing: Arc<dyn BillingProvider>,
    accounts: Arc<dyn AccountDirectory>,
    snapshots: Arc<SnapshotStore>,
    runner: TransformRunner,
    compensator: Compensator,
    hub: ProgressHub,
    /// Running sessions and sessions awaiting manual review
    sessions: DashMap<SessionId, SessionSlot>,
    finished: Cache<SessionId, SessionSlot>,
    active_users: DashMap<UserId, SessionId>,
    review_pending: DashMap<UserId, SessionId>,
}

/// Saga executor for tier changes
#[derive(Clone)]
pub struct MigrationExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("sessions", &self.inner.sessions.len())
            .field("finished", &self.inner.finished.entry_count())
            .field("active_users", &self.inner.active_users.len())
            .field("hub", &self.inner.hub)
            .finish_non_exhaustive()
    }
}

impl MigrationExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(config: OrchestratorConfig, resolver: TierResolver, collaborators: Collaborators) -> Self {
        let Collaborators {
            data,
            billing,
            accounts,
        } = collaborators;
        let snapshots = Arc::new(SnapshotStore::with_retention(
            Arc::clone(&data),
            config.snapshot_retention,
        ));
        let runner = TransformRunner::new(
            data,
            config.max_transform_attempts,
            config.backoff(1),
        );
        let compensator = Compensator::new(
            Arc::clone(&snapshots),
            Arc::clone(&accounts),
            Arc::clone(&billing),
            runner.clone(),
        );
        let hub = ProgressHub::new(config.progress_channel_capacity);
        let finished = Cache::builder()
            .time_to_live(config.session_retention())
            .build();
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                billing,
                accounts,
                snapshots,
                runner,
                compensator,
                hub,
                sessions: DashMap::new(),
                finished,
                active_users: DashMap::new(),
                review_pending: DashMap::new(),
            }),
        }
    }

    /// Register an observer that sees every event of every session
    pub fn add_observer(&self, observer: Arc<dyn ProgressObserver>) {
        self.inner.hub.add_observer(observer);
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Shared snapshot store
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.inner.snapshots
    }

    /// New preservation monitor over this executor's snapshots
    #[must_use]
    pub fn preservation_monitor(&self) -> PreservationMonitor {
        PreservationMonitor::new(
            Arc::clone(&self.inner.snapshots),
            self.inner.config.monitor_interval(),
        )
    }

    /// Validate, register and spawn an upgrade
    ///
    /// # Errors
    /// Returns a validation error, [`UpgradeError::UpgradeInProgress`] or
    /// [`UpgradeError::ManualReviewPending`]; no session is created then.
    pub async fn start_upgrade(&self, request: UpgradeRequest) -> Result<UpgradeHandle, UpgradeError> {
        let (slot, events) = self.register(&request).await?;
        let session_id = slot.read().session_id;
        let this = self.clone();
        let join = tokio::spawn(async move { this.drive(slot).await });
        Ok(UpgradeHandle {
            session_id,
            events,
            join,
        })
    }

    /// Validate, register and run an upgrade to the end on the current task
    ///
    /// # Errors
    /// Same as [`start_upgrade`](Self::start_upgrade). Step failures are not
    /// errors; they are recorded on the returned session.
    pub async fn execute(&self, request: UpgradeRequest) -> Result<UpgradeSession, UpgradeError> {
        let (slot, _events) = self.register(&request).await?;
        Ok(self.drive(slot).await)
    }

    /// Attach another progress receiver to a session
    ///
    /// A session that is no longer emitting yields a receiver that reports
    /// `Closed` on the first `recv`.
    ///
    /// # Errors
    /// Returns [`UpgradeError::SessionNotFound`] for unknown sessions
    pub fn subscribe(&self, session_id: SessionId) -> Result<broadcast::Receiver<ProgressEvent>, UpgradeError> {
        self.slot(session_id)?;
        Ok(self
            .inner
            .hub
            .subscribe(session_id)
            .unwrap_or_else(|| self.inner.hub.closed_receiver()))
    }

    /// Current view of a session
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<UpgradeSession> {
        self.slot(session_id).ok().map(|slot| slot.read().clone())
    }

    /// Session currently running for a user
    #[must_use]
    pub fn active_session(&self, user: &UserId) -> Option<SessionId> {
        self.inner.active_users.get(user).map(|id| *id)
    }

    /// Request cancellation
    ///
    /// Honoured at the next step boundary; only allowed before billing.
    ///
    /// # Errors
    /// Returns [`UpgradeError::CancellationRejected`] once `upgrading` has begun
    pub fn cancel(&self, session_id: SessionId) -> Result<(), UpgradeError> {
        let slot = self.slot(session_id)?;
        let mut session = slot.write();
        if !session.state.is_cancellable() {
            return Err(UpgradeError::CancellationRejected {
                session_id,
                state: session.state,
            });
        }
        session.cancel_requested = true;
        tracing::info!(%session_id, state = %session.state, "cancellation requested");
        Ok(())
    }

    /// Start a new session with the same request as a finished one
    ///
    /// # Errors
    /// Returns [`UpgradeError::NotRetryable`] while the session is active or
    /// while its rollback has not been confirmed
    pub async fn retry(&self, session_id: SessionId) -> Result<UpgradeHandle, UpgradeError> {
        let request = {
            let slot = self.slot(session_id)?;
            let session = slot.read();
            if !session.is_retryable() {
                return Err(UpgradeError::NotRetryable {
                    session_id,
                    state: session.state,
                });
            }
            UpgradeRequest::new(
                session.user_id.clone(),
                session.target_tier,
                session.billing_interval,
            )
        };
        tracing::info!(%session_id, "retrying upgrade");
        self.start_upgrade(request).await
    }

    /// Re-attempt compensation for a session left in `failed`
    ///
    /// # Errors
    /// Returns [`UpgradeError::RollbackInProgress`] while the session is
    /// still being driven, or [`UpgradeError::NotRollbackable`]
    pub async fn rollback(&self, session_id: SessionId) -> Result<RollbackReport, UpgradeError> {
        let slot = self.slot(session_id)?;
        let user = slot.read().user_id.clone();
        self.acquire_user(&user, session_id)?;
        self.inner.sessions.insert(session_id, Arc::clone(&slot));
        self.inner.finished.invalidate(&session_id);
        let _ = self.inner.hub.open(session_id);

        let result = self.compensate(&slot).await;
        self.release_user(&user, session_id);
        self.inner.hub.close(session_id);
        self.park(session_id);
        result
    }

    /// Operator sign-off on a session whose rollback stayed partial
    ///
    /// Unblocks new upgrades for the user. The session stays `failed`.
    ///
    /// # Errors
    /// Returns [`UpgradeError::SessionNotFound`] for unknown sessions
    pub fn acknowledge_manual_review(&self, session_id: SessionId) -> Result<bool, UpgradeError> {
        let slot = self.slot(session_id)?;
        {
            let mut session = slot.write();
            if !session.needs_manual_review {
                return Ok(false);
            }
            session.needs_manual_review = false;
            self.inner
                .review_pending
                .remove_if(&session.user_id, |_, pending| *pending == session_id);
            tracing::info!(%session_id, user_id = %session.user_id, "manual review acknowledged");
        }
        if self.active_session(&slot.read().user_id) != Some(session_id) {
            self.park(session_id);
        }
        Ok(true)
    }

    fn slot(&self, session_id: SessionId) -> Result<SessionSlot, UpgradeError> {
        if let Some(slot) = self.inner.sessions.get(&session_id) {
            return Ok(Arc::clone(&slot));
        }
        self.inner
            .finished
            .get(&session_id)
            .ok_or(UpgradeError::SessionNotFound(session_id))
    }

    /// Move a session that stopped running into the retention cache
    ///
    /// Sessions awaiting manual review stay pinned.
    fn park(&self, session_id: SessionId) {
        let Some(slot) = self.inner.sessions.get(&session_id).map(|s| Arc::clone(&s)) else {
            return;
        };
        if slot.read().needs_manual_review {
            return;
        }
        self.inner.finished.insert(session_id, slot);
        self.inner.sessions.remove(&session_id);
    }

    fn acquire_user(&self, user: &UserId, session_id: SessionId) -> Result<(), UpgradeError> {
        match self.inner.active_users.entry(user.clone()) {
            Entry::Occupied(entry) if *entry.get() == session_id => {
                Err(UpgradeError::RollbackInProgress(session_id))
            }
            Entry::Occupied(_) => Err(UpgradeError::UpgradeInProgress {
                user_id: user.clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(session_id);
                Ok(())
            }
        }
    }

    fn release_user(&self, user: &UserId, session_id: SessionId) {
        self.inner
            .active_users
            .remove_if(user, |_, active| *active == session_id);
    }

    async fn register(
        &self,
        request: &UpgradeRequest,
    ) -> Result<(SessionSlot, broadcast::Receiver<ProgressEvent>), UpgradeError> {
        let user = &request.user_id;
        if user.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyUserId.into());
        }
        self.inner
            .resolver
            .ensure_interval(request.target_tier, request.billing_interval)
            .map_err(|e| match e {
                TierConfigError::UnsupportedInterval { tier, interval } => {
                    UpgradeError::from(ValidationError::UnsupportedInterval { tier, interval })
                }
                other => other.into(),
            })?;

        // The plan of record is only read while holding the user guard
        let session_id = SessionId::new();
        self.acquire_user(user, session_id)?;
        let (current_plan, diff) = match self.plan_change(request).await {
            Ok(planned) => planned,
            Err(e) => {
                self.release_user(user, session_id);
                return Err(e);
            }
        };

        let slot = Arc::new(RwLock::new(UpgradeSession::new(
            session_id,
            request,
            current_plan,
            diff,
        )));
        self.inner.sessions.insert(session_id, Arc::clone(&slot));
        let events = self.inner.hub.open(session_id);

        metrics::counter!("tuo_upgrades_started_total").increment(1);
        tracing::info!(
            %session_id,
            user_id = %user,
            from = %current_plan.tier,
            to = %request.target_tier,
            interval = %request.billing_interval,
            "upgrade session registered"
        );
        Ok((slot, events))
    }

    async fn plan_change(&self, request: &UpgradeRequest) -> Result<(AccountPlan, TierDiff), UpgradeError> {
        let user = &request.user_id;
        if let Some(pending) = self.inner.review_pending.get(user) {
            return Err(UpgradeError::ManualReviewPending {
                user_id: user.clone(),
                session_id: *pending,
            });
        }
        let current_plan = self.inner.accounts.plan_of(user).await?.unwrap_or_default();
        if current_plan.tier == request.target_tier {
            return Err(ValidationError::SameTier(request.target_tier).into());
        }
        let diff = self.inner.resolver.diff(current_plan.tier, request.target_tier)?;
        Ok((current_plan, diff))
    }

    async fn drive(&self, slot: SessionSlot) -> UpgradeSession {
        let (session_id, user, from, to) = {
            let s = slot.read();
            (s.session_id, s.user_id.clone(), s.current_tier(), s.target_tier)
        };
        let span = tracing::info_span!(
            "upgrade",
            %session_id,
            user_id = %user,
            from = %from,
            to = %to
        );

        async {
            self.emit(&slot, None);
            match self.run_steps(&slot).await {
                Ok(()) => {
                    metrics::counter!("tuo_upgrades_completed_total").increment(1);
                    tracing::info!("upgrade completed");
                }
                Err(failure) => self.fail(&slot, failure).await,
            }
            self.release_user(&user, session_id);
            self.inner.hub.close(session_id);
            self.park(session_id);
        }
        .instrument(span)
        .await;

        let session = slot.read().clone();
        session
    }

    async fn run_steps(&self, slot: &SessionSlot) -> Result<(), StepFailure> {
        let (session_id, user, target, interval, transforms) = {
            let s = slot.read();
            (
                s.session_id,
                s.user_id.clone(),
                s.target_tier,
                s.billing_interval,
                s.diff.data_transforms.clone(),
            )
        };

        self.advance(slot, UpgradeState::BackingUp)?;
        let snapshot = self
            .inner
            .snapshots
            .capture(&user, session_id)
            .await
            .map_err(StepFailure::from_error)?;
        {
            let mut s = slot.write();
            s.snapshot_id = Some(snapshot.snapshot_id());
            s.snapshot = Some(Arc::clone(&snapshot));
        }

        self.advance(slot, UpgradeState::Upgrading)?;
        let already_charged = std::mem::replace(&mut slot.write().charge_attempted, true);
        if already_charged {
            return Err(StepFailure::new(FailureKind::Internal, "charge already attempted for this session"));
        }
        let receipt = self
            .inner
            .billing
            .charge(&user, target, interval)
            .await
            .map_err(StepFailure::from_error)?;
        if !receipt.success {
            let reason = receipt.decline_reason.unwrap_or_else(|| "payment declined".into());
            return Err(StepFailure::new(
                FailureKind::Billing,
                format!("Payment was not accepted: {reason}"),
            ));
        }
        slot.write().charge_id = receipt.charge_id;

        self.advance(slot, UpgradeState::Migrating)?;
        let outcome = self.inner.runner.apply_all(&user, &transforms).await;
        slot.write().applied_transforms = outcome.applied.clone();
        if !outcome.is_success() {
            return Err(StepFailure::new(FailureKind::Migration, outcome.failure_summary()));
        }

        self.advance(slot, UpgradeState::Restoring)?;
        let report = self.inner.snapshots.verify(&snapshot).await;
        if !report.is_complete() {
            tracing::warn!(
                unpreserved = report.total() - report.preserved(),
                "snapshot verification found drift, repairing"
            );
            let repaired = self
                .inner
                .snapshots
                .restore(&snapshot)
                .await
                .map_err(StepFailure::from_error)?;
            if !repaired.is_complete() {
                return Err(StepFailure::new(
                    FailureKind::Restore,
                    format!(
                        "{} of {} item(s) could not be verified",
                        repaired.total() - repaired.preserved(),
                        repaired.total()
                    ),
                ));
            }
        }

        self.advance(slot, UpgradeState::Finalizing)?;
        self.inner
            .accounts
            .set_plan(&user, AccountPlan::new(target, interval))
            .await
            .map_err(StepFailure::from_error)?;
        if let Err(e) = self.inner.snapshots.retire(snapshot.snapshot_id()).await {
            tracing::warn!(error = %e, "snapshot could not be retired");
        }

        self.advance(slot, UpgradeState::Completed)?;
        Ok(())
    }

    /// Enter `next` unless cancellation was requested, then emit its event
    fn advance(&self, slot: &SessionSlot, next: UpgradeState) -> Result<(), StepFailure> {
        {
            let mut s = slot.write();
            if s.cancel_requested {
                return Err(StepFailure::from_error(UpgradeError::Cancelled));
            }
            validate_transition(s.state, next).map_err(StepFailure::from_error)?;
            s.enter(next);
        }
        tracing::debug!(state = %next, "state entered");
        self.emit(slot, None);
        Ok(())
    }

    async fn fail(&self, slot: &SessionSlot, failure: StepFailure) {
        let step = {
            let mut s = slot.write();
            let step = s.state;
            s.error = Some(FailureDescriptor::new(failure.kind, step, failure.message.clone()));
            s.enter(UpgradeState::Failed);
            step
        };
        metrics::counter!("tuo_upgrades_failed_total", "kind" => failure.kind.as_str()).increment(1);
        tracing::warn!(%step, kind = %failure.kind, message = %failure.message, "upgrade step failed");
        self.emit(slot, Some(failure.message.clone()));

        let (snapshot_id, can_rollback) = {
            let s = slot.read();
            (s.snapshot_id, s.can_rollback())
        };
        if failure.kind == FailureKind::Cancelled {
            if let Some(id) = snapshot_id {
                self.inner.snapshots.discard(id).await;
            }
            return;
        }
        if !self.inner.config.auto_compensate || !can_rollback {
            return;
        }
        if let Err(e) = self.compensate(slot).await {
            tracing::error!(error = %e, "compensation could not run");
        }
    }

    async fn compensate(&self, slot: &SessionSlot) -> Result<RollbackReport, UpgradeError> {
        let mut working = slot.read().clone();
        let report = self.inner.compensator.rollback(&mut working).await?;
        let user = working.user_id.clone();
        let session_id = working.session_id;

        let message = if report.success {
            working.needs_manual_review = false;
            validate_transition(working.state, UpgradeState::RolledBack)?;
            working.enter(UpgradeState::RolledBack);
            self.inner
                .review_pending
                .remove_if(&user, |_, pending| *pending == session_id);
            if let Some(id) = working.snapshot_id {
                if let Err(e) = self.inner.snapshots.retire(id).await {
                    tracing::debug!(error = %e, "snapshot already retired");
                }
            }
            None
        } else {
            working.needs_manual_review = true;
            let step = working.error.as_ref().map_or(UpgradeState::Failed, |e| e.step);
            let message = format!(
                "Rollback incomplete: {} item(s) not restored; {}",
                report.unrestored_items.len(),
                report.issues.join("; ")
            );
            working.error = Some(FailureDescriptor::new(FailureKind::RollbackPartial, step, message.clone()));
            self.inner.review_pending.insert(user, session_id);
            Some(message)
        };

        *slot.write() = working;
        self.emit(slot, message);
        Ok(report)
    }

    fn emit(&self, slot: &SessionSlot, message: Option<String>) {
        let event = {
            let s = slot.read();
            ProgressEvent {
                session_id: s.session_id,
                user_id: s.user_id.clone(),
                state: s.state,
                message: message.unwrap_or_else(|| s.state.message().to_string()),
                progress_percent: s.progress_percent,
                at: Utc::now(),
            }
        };
        self.inner.hub.publish(event);
    }
}
