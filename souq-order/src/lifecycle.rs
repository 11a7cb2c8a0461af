//! Delivery lifecycle transitions.
//!
//! These are pure aggregate mutations; repositories call them inside their
//! transaction boundary so the memory engine and the Postgres store share
//! one source of domain truth.

use chrono::{DateTime, Duration, Utc};

use souq_core::{EngineError, EngineResult};

use crate::models::{DeliveryStatus, SubOrder};

/// Move a sub-order to `next`, appending the history entry.
///
/// On the Delivered transition the return window is computed as
/// `delivered_at + return_window_days`; it is the deadline after which
/// escrow may auto-release absent a dispute.
pub fn apply_transition(
    sub_order: &mut SubOrder,
    next: DeliveryStatus,
    actor: &str,
    notes: Option<String>,
    return_window_days: i64,
) -> EngineResult<()> {
    if !sub_order.delivery_status.may_become(next) {
        return Err(EngineError::Conflict(format!(
            "sub-order {} cannot move {:?} -> {:?}",
            sub_order.id, sub_order.delivery_status, next
        )));
    }
    if next == DeliveryStatus::Refunded {
        // Post-delivery refunds only happen through adjudication, which
        // flips the escrow flags in the same transaction.
        return Err(EngineError::Validation(
            "refunds are resolved through adjudication, not a status update".to_string(),
        ));
    }

    sub_order.delivery_status = next;
    sub_order.append_status(next, actor, notes);

    if next == DeliveryStatus::Delivered {
        let delivered_at = sub_order
            .status_history
            .last()
            .map(|e| e.at)
            .unwrap_or_else(Utc::now);
        sub_order.return_window = Some(delivered_at + Duration::days(return_window_days));
    }

    Ok(())
}

/// Record the customer's manual delivery confirmation.
///
/// Idempotent: confirming twice is a no-op, not an error.
pub fn confirm_delivery(sub_order: &mut SubOrder, now: DateTime<Utc>) -> EngineResult<()> {
    if sub_order.delivery_status != DeliveryStatus::Delivered {
        return Err(EngineError::Validation(format!(
            "sub-order {} is {:?}, only Delivered can be confirmed",
            sub_order.id, sub_order.delivery_status
        )));
    }
    if sub_order.confirmation.confirmed {
        return Ok(());
    }
    sub_order.confirmation.confirmed = true;
    sub_order.confirmation.confirmed_at = Some(now);
    sub_order.confirmation.auto_confirmed = false;
    sub_order.append_status(
        DeliveryStatus::Delivered,
        "CUSTOMER:confirmation",
        Some("customer confirmed delivery".to_string()),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderLine, ShippingSnapshot};
    use uuid::Uuid;

    fn sub_order() -> SubOrder {
        SubOrder::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![OrderLine {
                product_id: Uuid::new_v4(),
                name: "Linen Shirt".into(),
                unit_price: 5_000,
                size: Some("M".into()),
                quantity: 1,
                line_total: 5_000,
            }],
            ShippingSnapshot {
                method: "express".into(),
                fee: 800,
            },
            "CUSTOMER:c1",
        )
    }

    fn deliver(sub: &mut SubOrder) {
        for next in [
            DeliveryStatus::Processing,
            DeliveryStatus::Shipped,
            DeliveryStatus::OutForDelivery,
            DeliveryStatus::Delivered,
        ] {
            apply_transition(sub, next, "VENDOR:v1", None, 7).unwrap();
        }
    }

    #[test]
    fn test_delivered_sets_return_window() {
        let mut sub = sub_order();
        assert!(sub.return_window.is_none());
        deliver(&mut sub);

        let window = sub.return_window.unwrap();
        let delivered_at = sub.status_history.last().unwrap().at;
        assert_eq!(window, delivered_at + Duration::days(7));
        // One entry per transition, plus the creation entry.
        assert_eq!(sub.status_history.len(), 5);
    }

    #[test]
    fn test_invalid_transition_appends_no_history() {
        let mut sub = sub_order();
        let before = sub.status_history.len();
        let err =
            apply_transition(&mut sub, DeliveryStatus::Shipped, "VENDOR:v1", None, 7).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(sub.status_history.len(), before);
        assert_eq!(sub.delivery_status, DeliveryStatus::OrderPlaced);
    }

    #[test]
    fn test_refunded_is_not_a_plain_transition() {
        let mut sub = sub_order();
        deliver(&mut sub);
        let err =
            apply_transition(&mut sub, DeliveryStatus::Refunded, "ADMIN:ops", None, 7).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_confirm_delivery_is_idempotent() {
        let mut sub = sub_order();

        // Not yet delivered.
        assert!(confirm_delivery(&mut sub, Utc::now()).is_err());

        deliver(&mut sub);
        confirm_delivery(&mut sub, Utc::now()).unwrap();
        assert!(sub.confirmation.confirmed);
        let entries = sub.status_history.len();

        confirm_delivery(&mut sub, Utc::now()).unwrap();
        assert_eq!(sub.status_history.len(), entries);
    }
}
