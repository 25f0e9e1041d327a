//! Billing collaborator
//!
//! The orchestrator treats the provider as authoritative for money movement.
//! A declined charge is a normal [`ChargeReceipt`] with `success == false`;
//! [`BillingError`] is reserved for the provider itself misbehaving.

use crate::error::BillingError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tuo_snapshot::UserId;
use tuo_tiers::{BillingInterval, Tier, TierCapabilitySet};
use uuid::Uuid;

/// Provider charge identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargeId(pub Uuid);

impl ChargeId {
    /// Generate a new charge id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChargeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ChargeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ch_{}", self.0.simple())
    }
}

/// Result of a charge attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Money moved
    pub success: bool,
    /// Set when `success`
    pub charge_id: Option<ChargeId>,
    /// Provider reason when declined
    pub decline_reason: Option<String>,
}

impl ChargeReceipt {
    /// Successful charge
    #[must_use]
    pub fn approved(charge_id: ChargeId) -> Self {
        Self {
            success: true,
            charge_id: Some(charge_id),
            decline_reason: None,
        }
    }

    /// Declined charge; no money moved
    #[must_use]
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            charge_id: None,
            decline_reason: Some(reason.into()),
        }
    }
}

/// External billing capability
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BillingProvider: Send + Sync {
    /// Charge `user` for `tier` on `interval`
    async fn charge(
        &self,
        user: &UserId,
        tier: Tier,
        interval: BillingInterval,
    ) -> Result<ChargeReceipt, BillingError>;

    /// Reverse a charge
    async fn refund(&self, charge_id: &ChargeId) -> Result<(), BillingError>;
}

/// Ledger line kept by [`SimulatedBilling`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Charged user
    pub user_id: UserId,
    /// Tier charged for
    pub tier: Tier,
    /// Interval charged for
    pub interval: BillingInterval,
    /// Amount in minor currency units
    pub amount: u64,
    /// Refunded since
    pub refunded: bool,
}

/// Deterministic in-process billing provider
#[derive(Debug)]
pub struct SimulatedBilling {
    table: Arc<TierCapabilitySet>,
    decline: AtomicBool,
    fail_refunds: AtomicBool,
    charges: AtomicUsize,
    ledger: DashMap<ChargeId, LedgerEntry>,
}

impl SimulatedBilling {
    /// Provider pricing from the built-in capability table
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(TierCapabilitySet::builtin())
    }

    /// Provider pricing from `table`
    #[must_use]
    pub fn with_table(table: Arc<TierCapabilitySet>) -> Self {
        Self {
            table,
            decline: AtomicBool::new(false),
            fail_refunds: AtomicBool::new(false),
            charges: AtomicUsize::new(0),
            ledger: DashMap::new(),
        }
    }

    /// Decline every subsequent charge
    pub fn set_decline(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    /// Reject every subsequent refund
    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Number of `charge` calls, declined ones included
    #[must_use]
    pub fn charge_calls(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    /// Ledger entry for a charge
    #[must_use]
    pub fn entry(&self, charge_id: &ChargeId) -> Option<LedgerEntry> {
        self.ledger.get(charge_id).map(|e| e.clone())
    }

    /// Net amount collected from `user` (charges minus refunds)
    #[must_use]
    pub fn net_collected(&self, user: &UserId) -> u64 {
        self.ledger
            .iter()
            .filter(|e| &e.user_id == user && !e.refunded)
            .map(|e| e.amount)
            .sum()
    }
}

impl Default for SimulatedBilling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BillingProvider for SimulatedBilling {
    async fn charge(
        &self,
        user: &UserId,
        tier: Tier,
        interval: BillingInterval,
    ) -> Result<ChargeReceipt, BillingError> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        if self.decline.load(Ordering::SeqCst) {
            return Ok(ChargeReceipt::declined("card declined"));
        }
        let amount = self
            .table
            .price(tier, interval)
            .map_err(|e| BillingError::Unavailable(e.to_string()))?;
        let charge_id = ChargeId::new();
        self.ledger.insert(
            charge_id,
            LedgerEntry {
                user_id: user.clone(),
                tier,
                interval,
                amount,
                refunded: false,
            },
        );
        tracing::debug!(%charge_id, user_id = %user, %tier, amount, "simulated charge");
        Ok(ChargeReceipt::approved(charge_id))
    }

    async fn refund(&self, charge_id: &ChargeId) -> Result<(), BillingError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(BillingError::RefundRejected {
                charge_id: charge_id.to_string(),
                reason: "refund window closed".into(),
            });
        }
        let mut entry = self
            .ledger
            .get_mut(charge_id)
            .ok_or_else(|| BillingError::RefundRejected {
                charge_id: charge_id.to_string(),
                reason: "unknown charge".into(),
            })?;
        entry.refunded = true;
        tracing::debug!(%charge_id, "simulated refund");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn charge_records_price() {
        let billing = SimulatedBilling::new();
        let user = UserId::new("u1");
        let receipt = billing
            .charge(&user, Tier::Professional, BillingInterval::Monthly)
            .await
            .unwrap();
        assert!(receipt.success);
        let entry = billing.entry(&receipt.charge_id.unwrap()).unwrap();
        assert_eq!(entry.amount, 4900);
        assert_eq!(billing.net_collected(&user), 4900);
    }

    #[tokio::test]
    async fn decline_moves_no_money() {
        let billing = SimulatedBilling::new();
        billing.set_decline(true);
        let user = UserId::new("u1");
        let receipt = billing.charge(&user, Tier::Starter, BillingInterval::Yearly).await.unwrap();
        assert!(!receipt.success);
        assert!(receipt.charge_id.is_none());
        assert_eq!(billing.charge_calls(), 1);
        assert_eq!(billing.net_collected(&user), 0);
    }

    #[tokio::test]
    async fn refund_marks_ledger() {
        let billing = SimulatedBilling::new();
        let user = UserId::new("u1");
        let id = billing
            .charge(&user, Tier::Enterprise, BillingInterval::Yearly)
            .await
            .unwrap()
            .charge_id
            .unwrap();
        billing.refund(&id).await.unwrap();
        assert!(billing.entry(&id).unwrap().refunded);
        assert_eq!(billing.net_collected(&user), 0);
    }

    #[tokio::test]
    async fn unknown_refund_rejected() {
        let billing = SimulatedBilling::new();
        assert!(matches!(
            billing.refund(&ChargeId::new()).await,
            Err(BillingError::RefundRejected { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_interval_is_unavailable() {
        let billing = SimulatedBilling::new();
        let err = billing
            .charge(&UserId::new("u"), Tier::Free, BillingInterval::Yearly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Unavailable(_)));
    }
}
