use axum::{extract::State, Json};
use serde::Deserialize;

use souq_core::payment::{ConfirmationOutcome, PaymentConfirmation};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PaymentWebhook {
    pub idempotency_key: String,
    pub gateway_reference: String,
    pub amount_paid: i64,
}

/// POST /v1/webhooks/payments
///
/// Receive a verified payment confirmation from the gateway. Delivery is
/// at-least-once; re-delivery returns 200 with ALREADY_CONFIRMED and leaves
/// the order untouched, so the gateway never retries forever.
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<PaymentWebhook>,
) -> Result<Json<ConfirmationOutcome>, AppError> {
    tracing::info!(
        idempotency_key = %payload.idempotency_key,
        gateway_reference = %payload.gateway_reference,
        "payment webhook received"
    );

    let outcome = state
        .orders
        .confirm_payment(&PaymentConfirmation {
            idempotency_key: payload.idempotency_key,
            gateway_reference: payload.gateway_reference,
            amount_paid: payload.amount_paid,
        })
        .await?;

    Ok(Json(outcome))
}
