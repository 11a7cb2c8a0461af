//! Idempotent order creation from a multi-vendor cart.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use souq_core::catalog::CatalogLookup;
use souq_core::{EngineError, EngineResult};

use crate::models::{Order, OrderLine, ShippingSnapshot, SubOrder};
use crate::repository::OrderRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: u32,
}

/// Shipping selection for one vendor group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorShipping {
    pub vendor_id: Uuid,
    pub method: String,
    pub fee: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub idempotency_key: String,
    pub shipping_address: String,
    pub lines: Vec<CartLine>,
    pub shipping: Vec<VendorShipping>,
}

pub struct CheckoutService {
    catalog: Arc<dyn CatalogLookup>,
    orders: Arc<dyn OrderRepository>,
}

impl CheckoutService {
    pub fn new(catalog: Arc<dyn CatalogLookup>, orders: Arc<dyn OrderRepository>) -> Self {
        Self { catalog, orders }
    }

    /// Build one sub-order per vendor group, snapshotting product
    /// attributes immutably, and persist the whole aggregate atomically.
    ///
    /// Creation is idempotent: a second request with the same key is a
    /// Conflict and never produces a duplicate order. The key is checked
    /// here and enforced again by the store's unique constraint.
    pub async fn create_order(&self, request: CheckoutRequest) -> EngineResult<Order> {
        if request.idempotency_key.trim().is_empty() {
            return Err(EngineError::Validation(
                "an idempotency key is required".to_string(),
            ));
        }
        if request.lines.is_empty() {
            return Err(EngineError::Validation("the cart is empty".to_string()));
        }
        if request.lines.iter().any(|l| l.quantity == 0) {
            return Err(EngineError::Validation(
                "line quantities must be positive".to_string(),
            ));
        }

        if self
            .orders
            .order_by_idempotency_key(&request.idempotency_key)
            .await?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "an order with idempotency key '{}' already exists",
                request.idempotency_key
            )));
        }

        // Group snapshotted lines by vendor; BTreeMap keeps sub-order
        // creation deterministic.
        let mut groups: BTreeMap<Uuid, Vec<OrderLine>> = BTreeMap::new();
        for line in &request.lines {
            let snapshot = self
                .catalog
                .product(line.product_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("product {}", line.product_id))
                })?;
            groups
                .entry(snapshot.vendor_id)
                .or_default()
                .push(OrderLine::from_snapshot(&snapshot, line.quantity));
        }

        let mut order = Order::new(
            request.customer_id.clone(),
            request.idempotency_key.clone(),
            request.shipping_address.clone(),
        );
        let actor = format!("CUSTOMER:{}", request.customer_id);

        for (vendor_id, items) in groups {
            let shipping = request
                .shipping
                .iter()
                .find(|s| s.vendor_id == vendor_id)
                .map(|s| ShippingSnapshot {
                    method: s.method.clone(),
                    fee: s.fee,
                })
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "no shipping selection for vendor {vendor_id}"
                    ))
                })?;
            order.add_sub_order(SubOrder::new(order.id, vendor_id, items, shipping, &actor));
        }

        self.orders.create_order(&order).await?;
        tracing::info!(
            order_id = %order.id,
            customer_id = %order.customer_id,
            sub_orders = order.sub_orders.len(),
            total = order.total_amount,
            "order created"
        );
        Ok(order)
    }
}
