//! The consumed payment-gateway contract.
//!
//! The gateway's hosted checkout page is an external collaborator; the
//! engine only sees a verified confirmation callback, delivered at least
//! once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A verified payment confirmation from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub idempotency_key: String,
    pub gateway_reference: String,
    pub amount_paid: i64,
}

/// Outcome of applying a confirmation to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationOutcome {
    /// The order moved Pending -> Paid and escrow is now held.
    OrderConfirmed { order_id: Uuid },
    /// Re-delivery of a confirmation for an already-Paid order; a no-op.
    AlreadyConfirmed { order_id: Uuid },
}

impl ConfirmationOutcome {
    pub fn order_id(&self) -> Uuid {
        match self {
            ConfirmationOutcome::OrderConfirmed { order_id } => *order_id,
            ConfirmationOutcome::AlreadyConfirmed { order_id } => *order_id,
        }
    }
}
