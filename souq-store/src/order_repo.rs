//! Postgres `OrderRepository` and `SettlementRepository`.
//!
//! Mutations load the aggregate `FOR UPDATE`, apply the domain helper and
//! write back in one transaction. Settlement additionally keeps a
//! conditional-update guard on the escrow flags, so even a lost row lock
//! can never double-credit a wallet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use souq_core::money::CommissionBreakdown;
use souq_core::payment::{ConfirmationOutcome, PaymentConfirmation};
use souq_core::{EngineError, EngineResult};

use souq_order::escrow::{apply_refund, apply_release};
use souq_order::models::{
    DeliveryConfirmation, DeliveryStatus, Escrow, Order, OrderLine, PaymentStatus,
    ShippingSnapshot, StatusEntry, SubOrder,
};
use souq_order::payment::apply_confirmation;
use souq_order::repository::{
    OrderRepository, ReleaseFilter, ReleaseReceipt, SettlementRepository,
};
use souq_order::lifecycle;

use crate::db_err;

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn payment_status_str(s: PaymentStatus) -> &'static str {
    match s {
        PaymentStatus::Pending => "PENDING",
        PaymentStatus::Paid => "PAID",
        PaymentStatus::Failed => "FAILED",
    }
}

fn parse_payment_status(s: &str) -> EngineResult<PaymentStatus> {
    match s {
        "PENDING" => Ok(PaymentStatus::Pending),
        "PAID" => Ok(PaymentStatus::Paid),
        "FAILED" => Ok(PaymentStatus::Failed),
        other => Err(EngineError::Internal(format!(
            "unknown payment status '{other}'"
        ))),
    }
}

fn delivery_status_str(s: DeliveryStatus) -> &'static str {
    match s {
        DeliveryStatus::OrderPlaced => "ORDER_PLACED",
        DeliveryStatus::Processing => "PROCESSING",
        DeliveryStatus::Shipped => "SHIPPED",
        DeliveryStatus::OutForDelivery => "OUT_FOR_DELIVERY",
        DeliveryStatus::Delivered => "DELIVERED",
        DeliveryStatus::Canceled => "CANCELED",
        DeliveryStatus::Returned => "RETURNED",
        DeliveryStatus::FailedDelivery => "FAILED_DELIVERY",
        DeliveryStatus::Refunded => "REFUNDED",
    }
}

fn parse_delivery_status(s: &str) -> EngineResult<DeliveryStatus> {
    match s {
        "ORDER_PLACED" => Ok(DeliveryStatus::OrderPlaced),
        "PROCESSING" => Ok(DeliveryStatus::Processing),
        "SHIPPED" => Ok(DeliveryStatus::Shipped),
        "OUT_FOR_DELIVERY" => Ok(DeliveryStatus::OutForDelivery),
        "DELIVERED" => Ok(DeliveryStatus::Delivered),
        "CANCELED" => Ok(DeliveryStatus::Canceled),
        "RETURNED" => Ok(DeliveryStatus::Returned),
        "FAILED_DELIVERY" => Ok(DeliveryStatus::FailedDelivery),
        "REFUNDED" => Ok(DeliveryStatus::Refunded),
        other => Err(EngineError::Internal(format!(
            "unknown delivery status '{other}'"
        ))),
    }
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    customer_id: String,
    idempotency_key: String,
    shipping_address: String,
    payment_status: String,
    total_amount: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SubOrderRow {
    id: Uuid,
    order_id: Uuid,
    vendor_id: Uuid,
    items: Value,
    total_amount: i64,
    delivery_status: String,
    shipping_method: String,
    shipping_fee: i64,
    confirmed: bool,
    confirmed_at: Option<DateTime<Utc>>,
    auto_confirmed: bool,
    escrow_held: bool,
    escrow_released: bool,
    escrow_released_at: Option<DateTime<Utc>>,
    escrow_refunded: bool,
    refund_reason: Option<String>,
    return_window: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    status: String,
    actor: String,
    notes: Option<String>,
    at: DateTime<Utc>,
}

const SUB_ORDER_COLUMNS: &str = "id, order_id, vendor_id, items, total_amount, delivery_status, \
     shipping_method, shipping_fee, confirmed, confirmed_at, auto_confirmed, \
     escrow_held, escrow_released, escrow_released_at, escrow_refunded, \
     refund_reason, return_window";

fn sub_from_parts(row: SubOrderRow, events: Vec<EventRow>) -> EngineResult<SubOrder> {
    let items: Vec<OrderLine> = serde_json::from_value(row.items)
        .map_err(|e| EngineError::Internal(format!("corrupt items payload: {e}")))?;
    let mut history = Vec::with_capacity(events.len());
    for e in events {
        history.push(StatusEntry {
            status: parse_delivery_status(&e.status)?,
            at: e.at,
            actor: e.actor,
            notes: e.notes,
        });
    }
    Ok(SubOrder {
        id: row.id,
        order_id: row.order_id,
        vendor_id: row.vendor_id,
        items,
        total_amount: row.total_amount,
        delivery_status: parse_delivery_status(&row.delivery_status)?,
        shipping: ShippingSnapshot {
            method: row.shipping_method,
            fee: row.shipping_fee,
        },
        confirmation: DeliveryConfirmation {
            confirmed: row.confirmed,
            confirmed_at: row.confirmed_at,
            auto_confirmed: row.auto_confirmed,
        },
        escrow: Escrow {
            held: row.escrow_held,
            released: row.escrow_released,
            released_at: row.escrow_released_at,
            refunded: row.escrow_refunded,
            refund_reason: row.refund_reason,
        },
        return_window: row.return_window,
        status_history: history,
    })
}

impl PgOrderRepository {
    async fn events_for(
        tx: &mut Transaction<'_, Postgres>,
        sub_order_id: Uuid,
    ) -> EngineResult<Vec<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT status, actor, notes, at FROM sub_order_events WHERE sub_order_id = $1 ORDER BY seq",
        )
        .bind(sub_order_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn events_for_pool(&self, sub_order_id: Uuid) -> EngineResult<Vec<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT status, actor, notes, at FROM sub_order_events WHERE sub_order_id = $1 ORDER BY seq",
        )
        .bind(sub_order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Load one sub-order with its history, row-locked for the transaction.
    async fn lock_sub_order(
        tx: &mut Transaction<'_, Postgres>,
        sub_order_id: Uuid,
    ) -> EngineResult<SubOrder> {
        let row = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(sub_order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))?;
        let events = Self::events_for(tx, sub_order_id).await?;
        sub_from_parts(row, events)
    }

    async fn append_events(
        tx: &mut Transaction<'_, Postgres>,
        sub: &SubOrder,
        from_seq: usize,
    ) -> EngineResult<()> {
        for (seq, entry) in sub.status_history.iter().enumerate().skip(from_seq) {
            sqlx::query(
                "INSERT INTO sub_order_events (sub_order_id, seq, status, actor, notes, at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(sub.id)
            .bind(seq as i32)
            .bind(delivery_status_str(entry.status))
            .bind(&entry.actor)
            .bind(&entry.notes)
            .bind(entry.at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// Write back every field the lifecycle helpers may have touched.
    async fn store_sub_order(
        tx: &mut Transaction<'_, Postgres>,
        sub: &SubOrder,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE sub_orders SET delivery_status = $2, confirmed = $3, confirmed_at = $4,
                    auto_confirmed = $5, return_window = $6, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(sub.id)
        .bind(delivery_status_str(sub.delivery_status))
        .bind(sub.confirmation.confirmed)
        .bind(sub.confirmation.confirmed_at)
        .bind(sub.confirmation.auto_confirmed)
        .bind(sub.return_window)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn assemble_order(&self, row: OrderRow) -> EngineResult<Order> {
        let sub_rows = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders WHERE order_id = $1 ORDER BY created_at"
        ))
        .bind(row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut sub_orders = Vec::with_capacity(sub_rows.len());
        for sub_row in sub_rows {
            let events = self.events_for_pool(sub_row.id).await?;
            sub_orders.push(sub_from_parts(sub_row, events)?);
        }

        Ok(Order {
            id: row.id,
            customer_id: row.customer_id,
            total_amount: row.total_amount,
            payment_status: parse_payment_status(&row.payment_status)?,
            idempotency_key: row.idempotency_key,
            shipping_address: row.shipping_address,
            sub_orders,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(&self, order: &Order) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The unique index on idempotency_key turns a lost creation race
        // into a Conflict here.
        sqlx::query(
            "INSERT INTO orders (id, customer_id, idempotency_key, shipping_address,
                                 payment_status, total_amount, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(order.id)
        .bind(&order.customer_id)
        .bind(&order.idempotency_key)
        .bind(&order.shipping_address)
        .bind(payment_status_str(order.payment_status))
        .bind(order.total_amount)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for sub in &order.sub_orders {
            let items = serde_json::to_value(&sub.items)
                .map_err(|e| EngineError::Internal(format!("items serialization: {e}")))?;
            sqlx::query(
                "INSERT INTO sub_orders (id, order_id, vendor_id, items, total_amount,
                        delivery_status, shipping_method, shipping_fee, confirmed,
                        auto_confirmed, escrow_held, escrow_released, escrow_refunded,
                        return_window)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(sub.id)
            .bind(sub.order_id)
            .bind(sub.vendor_id)
            .bind(items)
            .bind(sub.total_amount)
            .bind(delivery_status_str(sub.delivery_status))
            .bind(&sub.shipping.method)
            .bind(sub.shipping.fee)
            .bind(sub.confirmation.confirmed)
            .bind(sub.confirmation.auto_confirmed)
            .bind(sub.escrow.held)
            .bind(sub.escrow.released)
            .bind(sub.escrow.refunded)
            .bind(sub.return_window)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            Self::append_events(&mut tx, sub, 0).await?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn order(&self, id: Uuid) -> EngineResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_id, idempotency_key, shipping_address, payment_status,
                    total_amount, created_at, updated_at
             FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.assemble_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn order_by_idempotency_key(&self, key: &str) -> EngineResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_id, idempotency_key, shipping_address, payment_status,
                    total_amount, created_at, updated_at
             FROM orders WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.assemble_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn sub_order(&self, id: Uuid) -> EngineResult<Option<SubOrder>> {
        let row = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let events = self.events_for_pool(row.id).await?;
                Ok(Some(sub_from_parts(row, events)?))
            }
            None => Ok(None),
        }
    }

    async fn confirm_payment(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> EngineResult<ConfirmationOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let order_row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_id, idempotency_key, shipping_address, payment_status,
                    total_amount, created_at, updated_at
             FROM orders WHERE idempotency_key = $1 FOR UPDATE",
        )
        .bind(&confirmation.idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            EngineError::NotFound(format!(
                "no order for idempotency key '{}'",
                confirmation.idempotency_key
            ))
        })?;

        let sub_rows = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders WHERE order_id = $1 ORDER BY created_at FOR UPDATE"
        ))
        .bind(order_row.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut sub_orders = Vec::with_capacity(sub_rows.len());
        for sub_row in sub_rows {
            let id = sub_row.id;
            let events = Self::events_for(&mut tx, id).await?;
            sub_orders.push(sub_from_parts(sub_row, events)?);
        }

        let mut order = Order {
            id: order_row.id,
            customer_id: order_row.customer_id,
            total_amount: order_row.total_amount,
            payment_status: parse_payment_status(&order_row.payment_status)?,
            idempotency_key: order_row.idempotency_key,
            shipping_address: order_row.shipping_address,
            sub_orders,
            created_at: order_row.created_at,
            updated_at: order_row.updated_at,
        };
        let prior_lens: Vec<usize> = order.sub_orders.iter().map(|s| s.status_history.len()).collect();

        let outcome = apply_confirmation(&mut order, confirmation)?;

        if matches!(outcome, ConfirmationOutcome::OrderConfirmed { .. }) {
            sqlx::query("UPDATE orders SET payment_status = $2, updated_at = NOW() WHERE id = $1")
                .bind(order.id)
                .bind(payment_status_str(order.payment_status))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            for (sub, prior) in order.sub_orders.iter().zip(prior_lens) {
                sqlx::query(
                    "UPDATE sub_orders SET escrow_held = TRUE, updated_at = NOW() WHERE id = $1",
                )
                .bind(sub.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                Self::append_events(&mut tx, sub, prior).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn apply_transition(
        &self,
        sub_order_id: Uuid,
        next: DeliveryStatus,
        actor: &str,
        notes: Option<String>,
        return_window_days: i64,
    ) -> EngineResult<SubOrder> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut sub = Self::lock_sub_order(&mut tx, sub_order_id).await?;
        let prior = sub.status_history.len();

        lifecycle::apply_transition(&mut sub, next, actor, notes, return_window_days)?;

        Self::store_sub_order(&mut tx, &sub).await?;
        Self::append_events(&mut tx, &sub, prior).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(sub)
    }

    async fn confirm_delivery(
        &self,
        sub_order_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<SubOrder> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut sub = Self::lock_sub_order(&mut tx, sub_order_id).await?;
        let prior = sub.status_history.len();

        lifecycle::confirm_delivery(&mut sub, now)?;

        Self::store_sub_order(&mut tx, &sub).await?;
        Self::append_events(&mut tx, &sub, prior).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(sub)
    }

    async fn list_release_eligible(
        &self,
        now: DateTime<Utc>,
        filter: &ReleaseFilter,
    ) -> EngineResult<Vec<SubOrder>> {
        // LIMIT NULL is LIMIT ALL.
        let rows = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders
             WHERE delivery_status = 'DELIVERED'
               AND escrow_held AND NOT escrow_released AND NOT escrow_refunded
               AND (confirmed OR (return_window IS NOT NULL AND return_window < $1))
               AND ($2::uuid IS NULL OR vendor_id = $2)
             ORDER BY return_window ASC NULLS LAST
             LIMIT $3"
        ))
        .bind(now)
        .bind(filter.vendor_id)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut eligible = Vec::with_capacity(rows.len());
        for row in rows {
            let events = self.events_for_pool(row.id).await?;
            eligible.push(sub_from_parts(row, events)?);
        }
        Ok(eligible)
    }

    async fn list_adjudication_queue(&self) -> EngineResult<Vec<SubOrder>> {
        // Oldest dispute first, by the timestamp of the event that put the
        // sub-order into its terminal status.
        let rows = sqlx::query_as::<_, SubOrderRow>(&format!(
            "SELECT {SUB_ORDER_COLUMNS} FROM sub_orders s
             WHERE delivery_status IN ('CANCELED', 'RETURNED', 'FAILED_DELIVERY')
               AND escrow_held AND NOT escrow_released AND NOT escrow_refunded
             ORDER BY (SELECT MAX(at) FROM sub_order_events e
                       WHERE e.sub_order_id = s.id AND e.status = s.delivery_status) ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut disputes = Vec::with_capacity(rows.len());
        for row in rows {
            let events = self.events_for_pool(row.id).await?;
            disputes.push(sub_from_parts(row, events)?);
        }
        Ok(disputes)
    }
}

#[async_trait]
impl SettlementRepository for PgOrderRepository {
    async fn release_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        notes: Option<String>,
        breakdown: &CommissionBreakdown,
        auto_confirmed: bool,
    ) -> EngineResult<ReleaseReceipt> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut sub = Self::lock_sub_order(&mut tx, sub_order_id).await?;
        let prior = sub.status_history.len();
        let now = Utc::now();

        apply_release(&mut sub, actor, notes, now, auto_confirmed)?;

        // Conditional update: the row lock already serializes callers, the
        // WHERE clause makes the once-only guarantee independent of it.
        let updated = sqlx::query(
            "UPDATE sub_orders SET escrow_released = TRUE, escrow_released_at = $2,
                    confirmed = $3, confirmed_at = $4, auto_confirmed = $5, updated_at = NOW()
             WHERE id = $1 AND escrow_held AND NOT escrow_released AND NOT escrow_refunded",
        )
        .bind(sub.id)
        .bind(sub.escrow.released_at)
        .bind(sub.confirmation.confirmed)
        .bind(sub.confirmation.confirmed_at)
        .bind(sub.confirmation.auto_confirmed)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "escrow for sub-order {sub_order_id} already resolved"
            )));
        }
        Self::append_events(&mut tx, &sub, prior).await?;

        sqlx::query(
            "INSERT INTO wallets (vendor_id, balance, total_earned, updated_at)
             VALUES ($1, $2, $2, NOW())
             ON CONFLICT (vendor_id) DO UPDATE
                SET balance = wallets.balance + $2,
                    total_earned = wallets.total_earned + $2,
                    updated_at = NOW()",
        )
        .bind(sub.vendor_id)
        .bind(breakdown.settle_amount)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let wallet_transaction_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO wallet_transactions (id, vendor_id, tx_type, amount, source,
                    related_id, related_type, description, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(wallet_transaction_id)
        .bind(sub.vendor_id)
        .bind("CREDIT")
        .bind(breakdown.settle_amount)
        .bind("ESCROW_RELEASE")
        .bind(sub.id)
        .bind("sub_order")
        .bind(format!(
            "escrow release: gross {} less commission {}",
            breakdown.gross, breakdown.commission
        ))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(ReleaseReceipt {
            sub_order_id,
            vendor_id: sub.vendor_id,
            breakdown: breakdown.clone(),
            wallet_transaction_id,
            released_at: now,
        })
    }

    async fn refund_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> EngineResult<SubOrder> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut sub = Self::lock_sub_order(&mut tx, sub_order_id).await?;
        let prior = sub.status_history.len();

        apply_refund(&mut sub, actor, reason)?;

        let updated = sqlx::query(
            "UPDATE sub_orders SET escrow_refunded = TRUE, refund_reason = $2,
                    delivery_status = $3, updated_at = NOW()
             WHERE id = $1 AND escrow_held AND NOT escrow_released AND NOT escrow_refunded",
        )
        .bind(sub.id)
        .bind(reason)
        .bind(delivery_status_str(sub.delivery_status))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "escrow for sub-order {sub_order_id} already resolved"
            )));
        }
        Self::append_events(&mut tx, &sub, prior).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(sub)
    }
}
