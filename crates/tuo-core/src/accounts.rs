//! Account directory collaborator (tier of record)

use crate::error::AccountError;
use crate::session::AccountPlan;
use dashmap::DashMap;
use tuo_snapshot::UserId;

/// Tier of record per user
#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Current plan; `None` for users who never subscribed (treated as free)
    async fn plan_of(&self, user: &UserId) -> Result<Option<AccountPlan>, AccountError>;

    /// Commit a new plan of record
    async fn set_plan(&self, user: &UserId, plan: AccountPlan) -> Result<(), AccountError>;
}

/// In-memory [`AccountDirectory`]
#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    plans: DashMap<UserId, AccountPlan>,
}

impl InMemoryAccounts {
    /// Create an empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a plan synchronously
    pub fn insert(&self, user: impl Into<UserId>, plan: AccountPlan) {
        self.plans.insert(user.into(), plan);
    }

    /// Current plan, free if unknown
    #[must_use]
    pub fn plan(&self, user: &UserId) -> AccountPlan {
        self.plans.get(user).map(|p| *p).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl AccountDirectory for InMemoryAccounts {
    async fn plan_of(&self, user: &UserId) -> Result<Option<AccountPlan>, AccountError> {
        Ok(self.plans.get(user).map(|p| *p))
    }

    async fn set_plan(&self, user: &UserId, plan: AccountPlan) -> Result<(), AccountError> {
        self.plans.insert(user.clone(), plan);
        Ok(())
    }
}
