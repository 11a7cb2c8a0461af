//! Applying gateway payment confirmations to an order.
//!
//! The webhook delivers at least once; applying a confirmation twice must be
//! a detectable no-op, and a mismatched amount must never flip the order.

use souq_core::payment::{ConfirmationOutcome, PaymentConfirmation};
use souq_core::{EngineError, EngineResult};

use crate::models::{Order, PaymentStatus};

/// Apply a verified confirmation to a loaded order. Repositories call this
/// inside their transaction and persist the result.
pub fn apply_confirmation(
    order: &mut Order,
    confirmation: &PaymentConfirmation,
) -> EngineResult<ConfirmationOutcome> {
    if order.payment_status == PaymentStatus::Paid {
        return Ok(ConfirmationOutcome::AlreadyConfirmed { order_id: order.id });
    }
    if confirmation.amount_paid != order.total_amount {
        return Err(EngineError::Gateway(format!(
            "amount mismatch for order {}: paid {}, expected {}",
            order.id, confirmation.amount_paid, order.total_amount
        )));
    }
    if order.sub_orders.is_empty() {
        // A Paid order must always carry at least one sub-order.
        return Err(EngineError::Internal(format!(
            "order {} has no sub-orders",
            order.id
        )));
    }

    order.payment_status = PaymentStatus::Paid;
    for sub_order in &mut order.sub_orders {
        sub_order.escrow.held = true;
        let status = sub_order.delivery_status;
        sub_order.append_status(
            status,
            "SYSTEM:gateway",
            Some(format!(
                "payment confirmed ({}); escrow held",
                confirmation.gateway_reference
            )),
        );
    }
    order.updated_at = chrono::Utc::now();

    Ok(ConfirmationOutcome::OrderConfirmed { order_id: order.id })
}
