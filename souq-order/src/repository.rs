//! Order persistence contracts.
//!
//! Multi-entity mutations are trait methods so the store owns the
//! transaction boundary; every guard is re-read inside that transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use souq_core::money::CommissionBreakdown;
use souq_core::payment::{ConfirmationOutcome, PaymentConfirmation};
use souq_core::EngineResult;

use crate::models::{DeliveryStatus, Order, SubOrder};

/// Filters for the release queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseFilter {
    pub vendor_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist the order and all its sub-orders atomically. A duplicate
    /// idempotency key is a Conflict and leaves exactly one order stored.
    async fn create_order(&self, order: &Order) -> EngineResult<()>;

    async fn order(&self, id: Uuid) -> EngineResult<Option<Order>>;

    async fn order_by_idempotency_key(&self, key: &str) -> EngineResult<Option<Order>>;

    async fn sub_order(&self, id: Uuid) -> EngineResult<Option<SubOrder>>;

    /// Apply a gateway confirmation: Pending -> Paid plus the escrow hold on
    /// every sub-order, in one transaction. Re-delivery returns
    /// `AlreadyConfirmed` without touching state.
    async fn confirm_payment(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> EngineResult<ConfirmationOutcome>;

    /// Validated delivery transition plus its history entry, atomically.
    async fn apply_transition(
        &self,
        sub_order_id: Uuid,
        next: DeliveryStatus,
        actor: &str,
        notes: Option<String>,
        return_window_days: i64,
    ) -> EngineResult<SubOrder>;

    /// Record the customer's manual delivery confirmation.
    async fn confirm_delivery(&self, sub_order_id: Uuid, now: DateTime<Utc>)
        -> EngineResult<SubOrder>;

    /// The escrow release queue: a live query over current state, never a
    /// cached snapshot.
    async fn list_release_eligible(
        &self,
        now: DateTime<Utc>,
        filter: &ReleaseFilter,
    ) -> EngineResult<Vec<SubOrder>>;

    /// Sub-orders awaiting refund adjudication, oldest terminal status
    /// first.
    async fn list_adjudication_queue(&self) -> EngineResult<Vec<SubOrder>>;
}

/// Result of a successful escrow release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub sub_order_id: Uuid,
    pub vendor_id: Uuid,
    pub breakdown: CommissionBreakdown,
    pub wallet_transaction_id: Uuid,
    pub released_at: DateTime<Utc>,
}

#[async_trait]
pub trait SettlementRepository: Send + Sync {
    /// The four release mutations in one transaction: flip
    /// `escrow.released`, append history, insert the Credit ledger row,
    /// bump wallet balance and total_earned. The released/refunded guard is
    /// re-read inside the transaction; the loser of a race gets a Conflict,
    /// never a second credit.
    async fn release_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        notes: Option<String>,
        breakdown: &CommissionBreakdown,
        auto_confirmed: bool,
    ) -> EngineResult<ReleaseReceipt>;

    /// Flip `escrow.refunded` with its reason and history entry; no wallet
    /// mutation (the gateway refund is an external concern). Same guard
    /// semantics as release.
    async fn refund_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> EngineResult<SubOrder>;
}
