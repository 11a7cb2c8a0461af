//! Refund adjudication: the manual-review queue for disputed or failed
//! deliveries.
//!
//! Sub-orders in Canceled, Returned or FailedDelivery never auto-release;
//! an admin resolves each one to exactly one of refund or override-release.
//! A Delivered sub-order with held escrow can also be refunded here (the
//! post-delivery dispute), which moves its status to Refunded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use souq_core::identity::Caller;
use souq_core::{EngineError, EngineResult};

use crate::escrow::SettlementService;
use crate::models::{DeliveryStatus, SubOrder};
use crate::repository::{OrderRepository, SettlementRepository};

/// An admin's resolution for one disputed sub-order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjudicationDecision {
    /// Money goes back to the customer through the gateway; no wallet
    /// transaction is written.
    ApproveRefund { reason: String },
    /// Settle to the vendor anyway; requires a justification note.
    OverrideRelease { justification: String },
}

pub struct AdjudicationService {
    orders: Arc<dyn OrderRepository>,
    settlement_repo: Arc<dyn SettlementRepository>,
    settlement: Arc<SettlementService>,
}

impl AdjudicationService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        settlement_repo: Arc<dyn SettlementRepository>,
        settlement: Arc<SettlementService>,
    ) -> Self {
        Self {
            orders,
            settlement_repo,
            settlement,
        }
    }

    /// Unresolved disputes, oldest terminal status first so no dispute
    /// starves behind newer ones.
    pub async fn queue(&self) -> EngineResult<Vec<SubOrder>> {
        self.orders.list_adjudication_queue().await
    }

    /// Resolve one dispute. Both outcomes are terminal: after this the
    /// sub-order is immutable with respect to money movement.
    pub async fn resolve(
        &self,
        sub_order_id: Uuid,
        decision: AdjudicationDecision,
        caller: &Caller,
    ) -> EngineResult<SubOrder> {
        let sub_order = self
            .orders
            .sub_order(sub_order_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))?;

        if !sub_order.escrow.unresolved() {
            return Err(EngineError::Conflict(format!(
                "sub-order {sub_order_id} has already been resolved"
            )));
        }
        let is_dispute = sub_order.delivery_status.needs_adjudication();

        match decision {
            AdjudicationDecision::ApproveRefund { reason } => {
                // Refunds also cover post-delivery disputes: a Delivered
                // sub-order with held escrow moves to Refunded.
                if !is_dispute && sub_order.delivery_status != DeliveryStatus::Delivered {
                    return Err(EngineError::Validation(format!(
                        "sub-order {sub_order_id} is {:?}, not a dispute",
                        sub_order.delivery_status
                    )));
                }
                if reason.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "a refund reason is required".to_string(),
                    ));
                }
                let resolved = self
                    .settlement_repo
                    .refund_escrow(sub_order_id, &caller.audit_tag(), &reason)
                    .await?;
                tracing::info!(sub_order_id = %sub_order_id, %reason, "refund approved");
                Ok(resolved)
            }
            AdjudicationDecision::OverrideRelease { justification } => {
                if !is_dispute {
                    return Err(EngineError::Validation(format!(
                        "sub-order {sub_order_id} is {:?}, not a dispute",
                        sub_order.delivery_status
                    )));
                }
                if justification.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "an override release requires a justification note".to_string(),
                    ));
                }
                let receipt = self
                    .settlement
                    .release_unchecked(
                        sub_order_id,
                        sub_order.total_amount,
                        &caller.audit_tag(),
                        Some(format!("override release: {justification}")),
                    )
                    .await?;
                tracing::warn!(
                    sub_order_id = %sub_order_id,
                    vendor_id = %receipt.vendor_id,
                    settle = receipt.breakdown.settle_amount,
                    "dispute resolved by override release"
                );
                self.orders
                    .sub_order(sub_order_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{CartLine, CheckoutRequest, CheckoutService, VendorShipping};
    use crate::memory::MemoryEngine;
    use crate::models::DeliveryStatus;
    use souq_core::catalog::ProductSnapshot;
    use souq_core::payment::PaymentConfirmation;

    async fn disputed_pair() -> (Arc<MemoryEngine>, AdjudicationService, Uuid, Uuid) {
        let engine = Arc::new(MemoryEngine::new());
        let vendor_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        engine
            .seed_product(ProductSnapshot {
                product_id,
                vendor_id,
                name: "Clay Teapot".into(),
                unit_price: 3_000,
                size: None,
            })
            .await;

        let checkout = CheckoutService::new(engine.clone(), engine.clone());
        let mut subs = Vec::new();
        for key in ["dispute-a", "dispute-b"] {
            let order = checkout
                .create_order(CheckoutRequest {
                    customer_id: "cust-1".into(),
                    idempotency_key: key.into(),
                    shipping_address: "5 Harbor Road".into(),
                    lines: vec![CartLine {
                        product_id,
                        quantity: 1,
                    }],
                    shipping: vec![VendorShipping {
                        vendor_id,
                        method: "standard".into(),
                        fee: 0,
                    }],
                })
                .await
                .unwrap();
            engine
                .confirm_payment(&PaymentConfirmation {
                    idempotency_key: key.into(),
                    gateway_reference: format!("gw-{key}"),
                    amount_paid: order.total_amount,
                })
                .await
                .unwrap();
            subs.push(order.sub_orders[0].id);
        }

        // Cancel in order so the first dispute carries the older terminal
        // timestamp.
        for &sub_id in &subs {
            engine
                .apply_transition(sub_id, DeliveryStatus::Canceled, "VENDOR:v1", None, 7)
                .await
                .unwrap();
        }

        let settlement = Arc::new(SettlementService::new(engine.clone(), engine.clone()));
        let adjudication =
            AdjudicationService::new(engine.clone(), engine.clone(), settlement);
        (engine, adjudication, subs[0], subs[1])
    }

    #[tokio::test]
    async fn test_queue_is_oldest_dispute_first() {
        let (_engine, adjudication, first, second) = disputed_pair().await;
        let queue = adjudication.queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].id, first);
        assert_eq!(queue[1].id, second);
    }

    #[tokio::test]
    async fn test_override_requires_justification() {
        let (engine, adjudication, first, _) = disputed_pair().await;
        let err = adjudication
            .resolve(
                first,
                AdjudicationDecision::OverrideRelease {
                    justification: "   ".into(),
                },
                &Caller::admin("ops-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Nothing was resolved; the dispute is still queued.
        let sub = engine.sub_order(first).await.unwrap().unwrap();
        assert!(sub.escrow.unresolved());
    }

    async fn delivered_single() -> (Arc<MemoryEngine>, AdjudicationService, Uuid) {
        let engine = Arc::new(MemoryEngine::new());
        let vendor_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        engine
            .seed_product(ProductSnapshot {
                product_id,
                vendor_id,
                name: "Cedar Chest".into(),
                unit_price: 8_000,
                size: None,
            })
            .await;

        let checkout = CheckoutService::new(engine.clone(), engine.clone());
        let order = checkout
            .create_order(CheckoutRequest {
                customer_id: "cust-1".into(),
                idempotency_key: "delivered-dispute".into(),
                shipping_address: "5 Harbor Road".into(),
                lines: vec![CartLine {
                    product_id,
                    quantity: 1,
                }],
                shipping: vec![VendorShipping {
                    vendor_id,
                    method: "standard".into(),
                    fee: 0,
                }],
            })
            .await
            .unwrap();
        engine
            .confirm_payment(&PaymentConfirmation {
                idempotency_key: "delivered-dispute".into(),
                gateway_reference: "gw-dd".into(),
                amount_paid: order.total_amount,
            })
            .await
            .unwrap();

        let sub_id = order.sub_orders[0].id;
        for next in [
            DeliveryStatus::Processing,
            DeliveryStatus::Shipped,
            DeliveryStatus::OutForDelivery,
            DeliveryStatus::Delivered,
        ] {
            engine
                .apply_transition(sub_id, next, "VENDOR:v1", None, 7)
                .await
                .unwrap();
        }

        let settlement = Arc::new(SettlementService::new(engine.clone(), engine.clone()));
        let adjudication =
            AdjudicationService::new(engine.clone(), engine.clone(), settlement);
        (engine, adjudication, sub_id)
    }

    #[tokio::test]
    async fn test_post_delivery_refund_moves_status_to_refunded() {
        let (engine, adjudication, sub_id) = delivered_single().await;

        let resolved = adjudication
            .resolve(
                sub_id,
                AdjudicationDecision::ApproveRefund {
                    reason: "item arrived damaged".into(),
                },
                &Caller::admin("ops-1"),
            )
            .await
            .unwrap();
        assert_eq!(resolved.delivery_status, DeliveryStatus::Refunded);
        assert!(resolved.escrow.refunded);
        assert!(!resolved.escrow.released);

        // The refund is terminal: a second resolution conflicts.
        let err = adjudication
            .resolve(
                sub_id,
                AdjudicationDecision::ApproveRefund {
                    reason: "duplicate".into(),
                },
                &Caller::admin("ops-1"),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let sub = engine.sub_order(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.delivery_status, DeliveryStatus::Refunded);
    }

    #[tokio::test]
    async fn test_override_release_is_only_for_terminal_disputes() {
        let (_engine, adjudication, sub_id) = delivered_single().await;
        let err = adjudication
            .resolve(
                sub_id,
                AdjudicationDecision::OverrideRelease {
                    justification: "vendor proof of delivery".into(),
                },
                &Caller::admin("ops-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_refund_requires_reason() {
        let (_engine, adjudication, first, _) = disputed_pair().await;
        let err = adjudication
            .resolve(
                first,
                AdjudicationDecision::ApproveRefund { reason: "".into() },
                &Caller::admin("ops-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
