//! Single-session-per-user guard, cancellation and retry rules.

use std::sync::Arc;
use std::time::Duration;
use tuo_core::{
    AccountPlan, Collaborators, FailureKind, MigrationExecutor, OrchestratorConfig,
    SimulatedBilling, UpgradeError, UpgradeRequest, UpgradeState,
};
use tuo_snapshot::UserId;
use tuo_test_utils::{seed_items, FaultyDataStore, GatedAccounts, Harness};
use tuo_tiers::{BillingInterval, Tier, TierResolver};

fn request(user: &str, tier: Tier) -> UpgradeRequest {
    UpgradeRequest::new(user, tier, BillingInterval::Monthly)
}

async fn wait_for_state(
    events: &mut tokio::sync::broadcast::Receiver<tuo_core::ProgressEvent>,
    state: UpgradeState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended early");
            if event.state == state {
                return;
            }
        }
    })
    .await
    .expect("state not reached in time");
}

#[tokio::test]
async fn second_session_for_same_user_rejected() {
    let h = Harness::new();
    let (user, _) = h.user("alice", Tier::Starter, 5);
    h.data.hold_listing();

    let mut first = h.executor.start_upgrade(request("alice", Tier::Professional)).await.unwrap();
    wait_for_state(&mut first.events, UpgradeState::BackingUp).await;

    let err = h
        .executor
        .start_upgrade(request("alice", Tier::Enterprise))
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::UpgradeInProgress { .. }));
    assert!(err.is_retryable());
    assert!(matches!(
        h.executor.retry(first.session_id).await,
        Err(UpgradeError::NotRetryable { state: UpgradeState::BackingUp, .. })
    ));
    assert!(matches!(
        h.executor.rollback(first.session_id).await,
        Err(UpgradeError::RollbackInProgress(_))
    ));

    h.data.open_listing();
    let session = first.wait().await.unwrap();
    assert_eq!(session.state, UpgradeState::Completed);
    assert!(h.executor.active_session(&user).is_none());
}

#[tokio::test]
async fn different_users_run_concurrently() {
    let h = Harness::new();
    for name in ["u1", "u2", "u3", "u4"] {
        h.user(name, Tier::Free, 4);
    }

    let mut handles = Vec::new();
    for name in ["u1", "u2", "u3", "u4"] {
        handles.push(h.executor.start_upgrade(request(name, Tier::Starter)).await.unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().state, UpgradeState::Completed);
    }
    assert_eq!(h.billing.charge_calls(), 4);
    assert!(h.audit.verify_integrity().is_ok());
}

#[tokio::test]
async fn cancel_during_backup_takes_no_money() {
    let h = Harness::new();
    let (user, _) = h.user("bob", Tier::Starter, 5);
    h.data.hold_listing();

    let mut handle = h.executor.start_upgrade(request("bob", Tier::Professional)).await.unwrap();
    let mut observer = h.executor.subscribe(handle.session_id).unwrap();
    wait_for_state(&mut handle.events, UpgradeState::BackingUp).await;

    h.executor.cancel(handle.session_id).unwrap();
    h.data.open_listing();

    let session = handle.wait().await.unwrap();
    assert_eq!(session.state, UpgradeState::Failed);
    assert_eq!(session.error.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(session.error.as_ref().unwrap().step, UpgradeState::BackingUp);
    assert_eq!(h.billing.charge_calls(), 0);
    assert_eq!(h.tier_of(&user), Tier::Starter);
    assert!(h.executor.snapshots().latest_for_user(&user).await.is_none());
    assert!(session.is_retryable());

    // The second subscriber saw the same sequence
    wait_for_state(&mut observer, UpgradeState::Failed).await;
}

#[tokio::test]
async fn cancel_after_billing_rejected() {
    let h = Harness::new();
    h.user("carol", Tier::Starter, 2);

    let session = h
        .executor
        .execute(request("carol", Tier::Professional))
        .await
        .unwrap();
    let err = h.executor.cancel(session.session_id).unwrap_err();
    assert!(matches!(
        err,
        UpgradeError::CancellationRejected { state: UpgradeState::Completed, .. }
    ));
}

#[tokio::test]
async fn completed_session_cannot_be_retried_or_rolled_back() {
    let h = Harness::new();
    h.user("dave", Tier::Starter, 2);
    let session = h
        .executor
        .execute(request("dave", Tier::Professional))
        .await
        .unwrap();

    assert!(matches!(
        h.executor.retry(session.session_id).await,
        Err(UpgradeError::NotRetryable { state: UpgradeState::Completed, .. })
    ));
    assert!(matches!(
        h.executor.rollback(session.session_id).await,
        Err(UpgradeError::NotRollbackable { .. })
    ));
}

#[tokio::test]
async fn retry_after_rollback_starts_new_session() {
    let h = Harness::new();
    let (user, _) = h.user("erin", Tier::Starter, 3);
    h.billing.set_decline(true);

    let failed = h
        .executor
        .execute(request("erin", Tier::Professional))
        .await
        .unwrap();
    assert_eq!(failed.state, UpgradeState::RolledBack);

    h.billing.set_decline(false);
    let handle = h.executor.retry(failed.session_id).await.unwrap();
    assert_ne!(handle.session_id, failed.session_id);
    let retried = handle.wait().await.unwrap();
    assert_eq!(retried.state, UpgradeState::Completed);
    assert_eq!(h.tier_of(&user), Tier::Professional);
    assert_eq!(h.billing.charge_calls(), 2);
}

#[tokio::test]
async fn racing_registration_never_reads_a_stale_plan() {
    let data = Arc::new(FaultyDataStore::new());
    let billing = Arc::new(SimulatedBilling::new());
    let accounts = Arc::new(GatedAccounts::new());
    let executor = MigrationExecutor::new(
        OrchestratorConfig::new().with_retry_backoff_ms(0),
        TierResolver::builtin(),
        Collaborators {
            data: data.clone(),
            billing: billing.clone(),
            accounts: accounts.clone(),
        },
    );
    let user = UserId::new("zoe");
    accounts
        .inner()
        .insert(user.clone(), AccountPlan::new(Tier::Starter, BillingInterval::Monthly));
    seed_items(data.inner(), &user, 4);

    // First request stalls inside its plan lookup
    accounts.hold_lookups();
    let first = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.start_upgrade(request("zoe", Tier::Professional)).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while accounts.lookups() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("first registration never reached the plan lookup");
    assert!(executor.active_session(&user).is_some());

    let err = executor
        .start_upgrade(request("zoe", Tier::Enterprise))
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::UpgradeInProgress { .. }));
    assert_eq!(accounts.lookups(), 1);

    accounts.open_lookups();
    let session = first.await.unwrap().unwrap().wait().await.unwrap();
    assert_eq!(session.state, UpgradeState::Completed);
    assert_eq!(accounts.inner().plan(&user).tier, Tier::Professional);

    // A later request starts from the committed plan
    billing.set_decline(true);
    let next = executor.execute(request("zoe", Tier::Enterprise)).await.unwrap();
    assert_eq!(next.current_plan.tier, Tier::Professional);
    assert_eq!(next.state, UpgradeState::RolledBack);
    assert_eq!(accounts.inner().plan(&user).tier, Tier::Professional);
    assert_eq!(billing.net_collected(&user), 4900);
}
