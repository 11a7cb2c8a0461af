//! Escrow release eligibility and settlement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use souq_core::identity::Caller;
use souq_core::money::commission;
use souq_core::{EngineError, EngineResult};

use crate::models::{DeliveryStatus, SubOrder};
use crate::repository::{OrderRepository, ReleaseFilter, ReleaseReceipt, SettlementRepository};

/// The release-eligibility rule, evaluated against current state on every
/// call:
/// Delivered AND (customer confirmed OR the return window has lapsed) AND
/// escrow held, not yet released, not yet refunded.
pub fn release_eligible(sub_order: &SubOrder, now: DateTime<Utc>) -> bool {
    sub_order.delivery_status == DeliveryStatus::Delivered
        && (sub_order.confirmation.confirmed
            || sub_order.return_window.map_or(false, |w| now > w))
        && sub_order.escrow.held
        && sub_order.escrow.unresolved()
}

/// Mutate a loaded sub-order for release. Repositories call this under
/// their transaction; the guard here is the authoritative re-check.
pub fn apply_release(
    sub_order: &mut SubOrder,
    actor: &str,
    notes: Option<String>,
    now: DateTime<Utc>,
    auto_confirmed: bool,
) -> EngineResult<()> {
    if sub_order.escrow.released {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} already released",
            sub_order.id
        )));
    }
    if sub_order.escrow.refunded {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} already refunded",
            sub_order.id
        )));
    }
    if !sub_order.escrow.held {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} is not held",
            sub_order.id
        )));
    }

    sub_order.escrow.released = true;
    sub_order.escrow.released_at = Some(now);
    if auto_confirmed && !sub_order.confirmation.confirmed {
        sub_order.confirmation.confirmed = true;
        sub_order.confirmation.confirmed_at = Some(now);
        sub_order.confirmation.auto_confirmed = true;
    }
    let status = sub_order.delivery_status;
    sub_order.append_status(
        status,
        actor,
        Some(notes.unwrap_or_else(|| "escrow released to vendor wallet".to_string())),
    );
    Ok(())
}

/// Mutate a loaded sub-order for refund. Same guard semantics as release.
pub fn apply_refund(sub_order: &mut SubOrder, actor: &str, reason: &str) -> EngineResult<()> {
    if sub_order.escrow.refunded {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} already refunded",
            sub_order.id
        )));
    }
    if sub_order.escrow.released {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} already released",
            sub_order.id
        )));
    }
    if !sub_order.escrow.held {
        return Err(EngineError::Conflict(format!(
            "escrow for sub-order {} is not held",
            sub_order.id
        )));
    }

    sub_order.escrow.refunded = true;
    sub_order.escrow.refund_reason = Some(reason.to_string());
    if sub_order.delivery_status == DeliveryStatus::Delivered {
        sub_order.delivery_status = DeliveryStatus::Refunded;
    }
    let status = sub_order.delivery_status;
    sub_order.append_status(status, actor, Some(format!("refund approved: {reason}")));
    Ok(())
}

/// Commission computation plus the atomic wallet credit for a released
/// sub-order.
pub struct SettlementService {
    orders: Arc<dyn OrderRepository>,
    settlement: Arc<dyn SettlementRepository>,
}

impl SettlementService {
    pub fn new(orders: Arc<dyn OrderRepository>, settlement: Arc<dyn SettlementRepository>) -> Self {
        Self { orders, settlement }
    }

    /// Sub-orders currently eligible for release; recomputed on every call.
    pub async fn release_queue(&self, filter: &ReleaseFilter) -> EngineResult<Vec<SubOrder>> {
        self.orders.list_release_eligible(Utc::now(), filter).await
    }

    /// Verify eligibility, compute the commission, and delegate the atomic
    /// four-mutation release to the store. Terminal-dispute sub-orders are
    /// rejected here and must go through adjudication.
    pub async fn release(
        &self,
        sub_order_id: Uuid,
        caller: &Caller,
        notes: Option<String>,
    ) -> EngineResult<ReleaseReceipt> {
        let sub_order = self
            .orders
            .sub_order(sub_order_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))?;

        if sub_order.escrow.released {
            return Err(EngineError::Conflict(format!(
                "escrow for sub-order {sub_order_id} already released"
            )));
        }
        if sub_order.escrow.refunded {
            return Err(EngineError::Conflict(format!(
                "escrow for sub-order {sub_order_id} already refunded"
            )));
        }
        if sub_order.delivery_status.needs_adjudication() {
            return Err(EngineError::Validation(format!(
                "sub-order {sub_order_id} is {:?} and must be resolved through adjudication",
                sub_order.delivery_status
            )));
        }

        let now = Utc::now();
        if !release_eligible(&sub_order, now) {
            return Err(EngineError::Validation(format!(
                "sub-order {sub_order_id} is not eligible for release (status {:?}, confirmed {}, window {:?})",
                sub_order.delivery_status,
                sub_order.confirmation.confirmed,
                sub_order.return_window
            )));
        }
        let auto_confirmed = !sub_order.confirmation.confirmed;

        let breakdown = commission(sub_order.total_amount);
        let receipt = self
            .settlement
            .release_escrow(
                sub_order_id,
                &caller.audit_tag(),
                notes,
                &breakdown,
                auto_confirmed,
            )
            .await?;

        tracing::info!(
            sub_order_id = %sub_order_id,
            vendor_id = %receipt.vendor_id,
            gross = breakdown.gross,
            commission = breakdown.commission,
            settle = breakdown.settle_amount,
            auto_confirmed,
            "escrow released"
        );
        Ok(receipt)
    }

    /// Release path used by adjudication overrides: skips the delivery
    /// eligibility rule but keeps every escrow guard.
    pub(crate) async fn release_unchecked(
        &self,
        sub_order_id: Uuid,
        total_amount: i64,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<ReleaseReceipt> {
        let breakdown = commission(total_amount);
        self.settlement
            .release_escrow(sub_order_id, actor, notes, &breakdown, false)
            .await
    }
}
