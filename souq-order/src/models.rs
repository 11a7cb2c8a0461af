use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use souq_core::catalog::ProductSnapshot;

/// Payment status of the root order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

/// Delivery status of a vendor sub-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    OrderPlaced,
    Processing,
    Shipped,
    OutForDelivery,
    Delivered,
    Canceled,
    Returned,
    FailedDelivery,
    Refunded,
}

impl DeliveryStatus {
    /// Forward chain plus dispute branches:
    /// OrderPlaced -> Processing -> Shipped -> OutForDelivery -> Delivered;
    /// any pre-Delivered state -> Canceled | Returned | FailedDelivery;
    /// Delivered -> Refunded (post-delivery dispute, adjudication only).
    pub fn may_become(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (*self, next) {
            (OrderPlaced, Processing)
            | (Processing, Shipped)
            | (Shipped, OutForDelivery)
            | (OutForDelivery, Delivered) => true,
            (from, Canceled | Returned | FailedDelivery) => {
                !from.is_terminal() && from != Delivered
            }
            (Delivered, Refunded) => true,
            _ => false,
        }
    }

    /// Terminal dispute states requiring refund adjudication.
    pub fn needs_adjudication(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Canceled | DeliveryStatus::Returned | DeliveryStatus::FailedDelivery
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.needs_adjudication() || matches!(self, DeliveryStatus::Refunded)
    }
}

/// Append-only transition record; the sole source for time-in-status
/// queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub notes: Option<String>,
}

/// One order line: the product snapshot taken at order time, plus quantity.
/// Immutable after creation; later catalog edits never touch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub size: Option<String>,
    pub quantity: u32,
    pub line_total: i64,
}

impl OrderLine {
    pub fn from_snapshot(snapshot: &ProductSnapshot, quantity: u32) -> Self {
        Self {
            product_id: snapshot.product_id,
            name: snapshot.name.clone(),
            unit_price: snapshot.unit_price,
            size: snapshot.size.clone(),
            quantity,
            line_total: snapshot.unit_price * quantity as i64,
        }
    }
}

/// Shipping selection snapshot for one vendor group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingSnapshot {
    pub method: String,
    pub fee: i64,
}

/// Customer delivery confirmation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfirmation {
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub auto_confirmed: bool,
}

/// Escrow flags for one sub-order. `released` and `refunded` are mutually
/// exclusive and each flips false -> true at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Escrow {
    pub held: bool,
    pub released: bool,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded: bool,
    pub refund_reason: Option<String>,
}

impl Escrow {
    /// Neither released nor refunded yet.
    pub fn unresolved(&self) -> bool {
        !self.released && !self.refunded
    }
}

/// The portion of a multi-vendor order belonging to one vendor, settled
/// independently of its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub items: Vec<OrderLine>,
    pub total_amount: i64,
    pub delivery_status: DeliveryStatus,
    pub shipping: ShippingSnapshot,
    pub confirmation: DeliveryConfirmation,
    pub escrow: Escrow,
    pub return_window: Option<DateTime<Utc>>,
    pub status_history: Vec<StatusEntry>,
}

impl SubOrder {
    pub fn new(
        order_id: Uuid,
        vendor_id: Uuid,
        items: Vec<OrderLine>,
        shipping: ShippingSnapshot,
        actor: &str,
    ) -> Self {
        let goods: i64 = items.iter().map(|l| l.line_total).sum();
        Self {
            id: Uuid::new_v4(),
            order_id,
            vendor_id,
            items,
            total_amount: goods + shipping.fee,
            delivery_status: DeliveryStatus::OrderPlaced,
            shipping,
            confirmation: DeliveryConfirmation::default(),
            escrow: Escrow::default(),
            return_window: None,
            status_history: vec![StatusEntry {
                status: DeliveryStatus::OrderPlaced,
                at: Utc::now(),
                actor: actor.to_string(),
                notes: None,
            }],
        }
    }

    pub fn append_status(&mut self, status: DeliveryStatus, actor: &str, notes: Option<String>) {
        self.status_history.push(StatusEntry {
            status,
            at: Utc::now(),
            actor: actor.to_string(),
            notes,
        });
    }

    /// Timestamp of the entry that put this sub-order into its current
    /// terminal dispute status; orders the adjudication queue.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        if !self.delivery_status.needs_adjudication() {
            return None;
        }
        self.status_history
            .iter()
            .rev()
            .find(|e| e.status == self.delivery_status)
            .map(|e| e.at)
    }
}

/// The root aggregate: one customer purchase fanned out into per-vendor
/// sub-orders, persisted together in one transactional unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: String,
    pub total_amount: i64,
    pub payment_status: PaymentStatus,
    pub idempotency_key: String,
    pub shipping_address: String,
    pub sub_orders: Vec<SubOrder>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        customer_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        shipping_address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            total_amount: 0,
            payment_status: PaymentStatus::Pending,
            idempotency_key: idempotency_key.into(),
            shipping_address: shipping_address.into(),
            sub_orders: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_sub_order(&mut self, sub_order: SubOrder) {
        self.total_amount += sub_order.total_amount;
        self.sub_orders.push(sub_order);
        self.updated_at = Utc::now();
    }

    pub fn sub_order(&self, id: Uuid) -> Option<&SubOrder> {
        self.sub_orders.iter().find(|s| s.id == id)
    }
}
