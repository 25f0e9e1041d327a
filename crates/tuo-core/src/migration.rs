//! Data transform application and reversal
//!
//! Every transform is attempted even after an earlier one fails; the step
//! fails as a whole if any transform exhausts its attempts. Transforms that
//! took effect are returned with the state they replaced so the compensator
//! can undo them in reverse order.

use crate::session::{AppliedTransform, Undo};
use std::sync::Arc;
use std::time::Duration;
use tuo_snapshot::{DataStore, FeatureState, StoreError, UserId};
use tuo_tiers::DataTransform;

/// A transform that could not be applied or reversed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    /// Transform
    pub transform: DataTransform,
    /// Attempts made
    pub attempts: u32,
    /// Last error
    pub error: StoreError,
}

/// Result of applying a batch of transforms
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Transforms that took effect, in application order
    pub applied: Vec<AppliedTransform>,
    /// Transforms that exhausted their attempts
    pub failures: Vec<TransformFailure>,
}

impl MigrationOutcome {
    /// No transform failed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line summary of the failures
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{} failed after {} attempt(s): {}", f.transform, f.attempts, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Applies and reverses [`DataTransform`]s with bounded retry
#[derive(Clone)]
pub struct TransformRunner {
    data: Arc<dyn DataStore>,
    max_attempts: u32,
    backoff: Duration,
}

impl std::fmt::Debug for TransformRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRunner")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl TransformRunner {
    /// Create a runner; `backoff` is multiplied by the attempt number
    #[must_use]
    pub fn new(data: Arc<dyn DataStore>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            data,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Apply every transform for `user`
    pub async fn apply_all(&self, user: &UserId, transforms: &[DataTransform]) -> MigrationOutcome {
        let mut outcome = MigrationOutcome::default();
        for transform in transforms {
            match self.with_retry(transform, || self.apply_once(user, transform)).await {
                Ok(Some(undo)) => outcome.applied.push(AppliedTransform {
                    transform: transform.clone(),
                    undo,
                }),
                Ok(None) => {
                    tracing::debug!(user_id = %user, %transform, "transform already in effect");
                }
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }

    /// Undo applied transforms, newest first
    ///
    /// Returns the transforms that could not be reverted.
    pub async fn reverse_all(
        &self,
        user: &UserId,
        applied: &[AppliedTransform],
    ) -> Vec<TransformFailure> {
        let mut failures = Vec::new();
        for entry in applied.iter().rev() {
            let result = self
                .with_retry(&entry.transform, || self.reverse_once(user, entry))
                .await;
            if let Err(failure) = result {
                failures.push(failure);
            }
        }
        failures
    }

    async fn with_retry<T, F, Fut>(&self, transform: &DataTransform, mut op: F) -> Result<T, TransformFailure>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && error.is_transient() => {
                    tracing::warn!(%transform, attempt, %error, "transform attempt failed, retrying");
                    metrics::counter!("tuo_transform_retries_total").increment(1);
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(%transform, attempts = attempt, %error, "transform failed");
                    return Err(TransformFailure {
                        transform: transform.clone(),
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }

    async fn apply_once(
        &self,
        user: &UserId,
        transform: &DataTransform,
    ) -> Result<Option<Undo>, StoreError> {
        match transform {
            DataTransform::ActivateFeature { feature } => {
                let prior = self.data.feature_state(user, feature).await?;
                if prior == FeatureState::Active {
                    return Ok(None);
                }
                self.data
                    .set_feature_state(user, feature, FeatureState::Active)
                    .await?;
                Ok(Some(Undo::RestoreFeature {
                    feature: feature.clone(),
                    state: prior,
                }))
            }
            DataTransform::ArchiveFeature { feature } => {
                let prior = self.data.feature_state(user, feature).await?;
                if prior != FeatureState::Active {
                    return Ok(None);
                }
                self.data
                    .set_feature_state(user, feature, FeatureState::Archived)
                    .await?;
                Ok(Some(Undo::RestoreFeature {
                    feature: feature.clone(),
                    state: prior,
                }))
            }
            DataTransform::ApplyLimits { to, .. } => {
                let prior = self.data.limits(user).await?;
                if prior == Some(*to) {
                    return Ok(None);
                }
                self.data.set_limits(user, Some(*to)).await?;
                Ok(Some(Undo::RestoreLimits { limits: prior }))
            }
        }
    }

    async fn reverse_once(&self, user: &UserId, entry: &AppliedTransform) -> Result<(), StoreError> {
        match &entry.undo {
            Undo::RestoreFeature { feature, state } => {
                self.data.set_feature_state(user, feature, *state).await
            }
            Undo::RestoreLimits { limits } => self.data.set_limits(user, *limits).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuo_snapshot::InMemoryDataStore;
    use tuo_tiers::{FeatureId, Limits};

    fn runner(data: Arc<InMemoryDataStore>) -> TransformRunner {
        TransformRunner::new(data, 3, Duration::ZERO)
    }

    #[tokio::test]
    async fn activate_then_reverse() {
        let data = Arc::new(InMemoryDataStore::new());
        let user = UserId::new("u1");
        let sso = FeatureId::new("sso");
        let runner = runner(data.clone());

        let outcome = runner
            .apply_all(&user, &[DataTransform::ActivateFeature { feature: sso.clone() }])
            .await;
        assert!(outcome.is_success());
        assert_eq!(data.feature(&user, &sso), FeatureState::Active);

        let failures = runner.reverse_all(&user, &outcome.applied).await;
        assert!(failures.is_empty());
        assert_eq!(data.feature(&user, &sso), FeatureState::Absent);
    }

    #[tokio::test]
    async fn activate_unarchives_earlier_data() {
        let data = Arc::new(InMemoryDataStore::new());
        let user = UserId::new("u1");
        let api = FeatureId::new("api_access");
        data.set_feature_state(&user, &api, FeatureState::Archived).await.unwrap();

        let outcome = runner(data.clone())
            .apply_all(&user, &[DataTransform::ActivateFeature { feature: api.clone() }])
            .await;
        assert_eq!(
            outcome.applied[0].undo,
            Undo::RestoreFeature { feature: api.clone(), state: FeatureState::Archived }
        );
        assert_eq!(data.feature(&user, &api), FeatureState::Active);
    }

    #[tokio::test]
    async fn archive_skips_inactive_feature() {
        let data = Arc::new(InMemoryDataStore::new());
        let user = UserId::new("u1");
        let outcome = runner(data)
            .apply_all(&user, &[DataTransform::ArchiveFeature { feature: FeatureId::new("sso") }])
            .await;
        assert!(outcome.is_success());
        assert!(outcome.applied.is_empty());
    }

    #[tokio::test]
    async fn limits_reverse_to_prior() {
        let data = Arc::new(InMemoryDataStore::new());
        let user = UserId::new("u1");
        let before = Limits { max_users: Some(1), ..Limits::default() };
        let after = Limits { max_users: Some(10), ..Limits::default() };
        data.set_limits(&user, Some(before)).await.unwrap();

        let runner = runner(data.clone());
        let outcome = runner
            .apply_all(&user, &[DataTransform::ApplyLimits { from: before, to: after }])
            .await;
        assert_eq!(data.limits(&user).await.unwrap(), Some(after));

        runner.reverse_all(&user, &outcome.applied).await;
        assert_eq!(data.limits(&user).await.unwrap(), Some(before));
    }
}
