//! In-memory engine implementing every repository trait plus the catalog
//! lookup.
//!
//! The order mutex models the store transaction: escrow guards are re-read
//! under the lock and the wallet credit happens before the lock drops, so
//! race tests (double release, double resolve) exercise the same exclusion
//! the Postgres store builds from conditional updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use souq_core::catalog::{CatalogLookup, ProductSnapshot};
use souq_core::money::CommissionBreakdown;
use souq_core::payment::{ConfirmationOutcome, PaymentConfirmation};
use souq_core::{EngineError, EngineResult};

use souq_wallet::memory::MemoryWallets;
use souq_wallet::models::{
    TxFilter, TxSource, Wallet, WalletTransaction, WithdrawalFilter, WithdrawalRequest,
    WithdrawalStatus,
};
use souq_wallet::repository::WalletRepository;

use crate::escrow::{apply_refund, apply_release, release_eligible};
use crate::lifecycle;
use crate::models::{DeliveryStatus, Order, SubOrder};
use crate::payment::apply_confirmation;
use crate::repository::{
    OrderRepository, ReleaseFilter, ReleaseReceipt, SettlementRepository,
};

#[derive(Default)]
struct Store {
    orders: HashMap<Uuid, Order>,
    by_key: HashMap<String, Uuid>,
    sub_index: HashMap<Uuid, Uuid>,
    products: HashMap<Uuid, ProductSnapshot>,
}

impl Store {
    fn order_of_sub(&self, sub_order_id: Uuid) -> EngineResult<Uuid> {
        self.sub_index
            .get(&sub_order_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))
    }

    fn sub_order_mut(&mut self, sub_order_id: Uuid) -> EngineResult<&mut SubOrder> {
        let order_id = self.order_of_sub(sub_order_id)?;
        self.orders
            .get_mut(&order_id)
            .and_then(|o| o.sub_orders.iter_mut().find(|s| s.id == sub_order_id))
            .ok_or_else(|| EngineError::NotFound(format!("sub-order {sub_order_id}")))
    }
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    store: Arc<Mutex<Store>>,
    wallets: MemoryWallets,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wallet half of the engine, for wiring it where a
    /// `WalletRepository` is expected.
    pub fn wallets(&self) -> MemoryWallets {
        self.wallets.clone()
    }

    pub async fn seed_product(&self, product: ProductSnapshot) {
        let mut store = self.store.lock().await;
        store.products.insert(product.product_id, product);
    }
}

#[async_trait]
impl CatalogLookup for MemoryEngine {
    async fn product(&self, id: Uuid) -> EngineResult<Option<ProductSnapshot>> {
        let store = self.store.lock().await;
        Ok(store.products.get(&id).cloned())
    }
}

#[async_trait]
impl OrderRepository for MemoryEngine {
    async fn create_order(&self, order: &Order) -> EngineResult<()> {
        let mut store = self.store.lock().await;
        // The unique-constraint check, re-done inside the "transaction".
        if store.by_key.contains_key(&order.idempotency_key) {
            return Err(EngineError::Conflict(format!(
                "an order with idempotency key '{}' already exists",
                order.idempotency_key
            )));
        }
        store
            .by_key
            .insert(order.idempotency_key.clone(), order.id);
        for sub in &order.sub_orders {
            store.sub_index.insert(sub.id, order.id);
        }
        store.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn order(&self, id: Uuid) -> EngineResult<Option<Order>> {
        let store = self.store.lock().await;
        Ok(store.orders.get(&id).cloned())
    }

    async fn order_by_idempotency_key(&self, key: &str) -> EngineResult<Option<Order>> {
        let store = self.store.lock().await;
        Ok(store
            .by_key
            .get(key)
            .and_then(|id| store.orders.get(id))
            .cloned())
    }

    async fn sub_order(&self, id: Uuid) -> EngineResult<Option<SubOrder>> {
        let store = self.store.lock().await;
        let Some(order_id) = store.sub_index.get(&id) else {
            return Ok(None);
        };
        Ok(store
            .orders
            .get(order_id)
            .and_then(|o| o.sub_order(id))
            .cloned())
    }

    async fn confirm_payment(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> EngineResult<ConfirmationOutcome> {
        let mut store = self.store.lock().await;
        let order_id = store
            .by_key
            .get(&confirmation.idempotency_key)
            .copied()
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "no order for idempotency key '{}'",
                    confirmation.idempotency_key
                ))
            })?;
        let order = store
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
        apply_confirmation(order, confirmation)
    }

    async fn apply_transition(
        &self,
        sub_order_id: Uuid,
        next: DeliveryStatus,
        actor: &str,
        notes: Option<String>,
        return_window_days: i64,
    ) -> EngineResult<SubOrder> {
        let mut store = self.store.lock().await;
        let sub = store.sub_order_mut(sub_order_id)?;
        lifecycle::apply_transition(sub, next, actor, notes, return_window_days)?;
        Ok(sub.clone())
    }

    async fn confirm_delivery(
        &self,
        sub_order_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<SubOrder> {
        let mut store = self.store.lock().await;
        let sub = store.sub_order_mut(sub_order_id)?;
        lifecycle::confirm_delivery(sub, now)?;
        Ok(sub.clone())
    }

    async fn list_release_eligible(
        &self,
        now: DateTime<Utc>,
        filter: &ReleaseFilter,
    ) -> EngineResult<Vec<SubOrder>> {
        let store = self.store.lock().await;
        let mut eligible: Vec<SubOrder> = store
            .orders
            .values()
            .flat_map(|o| o.sub_orders.iter())
            .filter(|s| release_eligible(s, now))
            .filter(|s| filter.vendor_id.map_or(true, |v| s.vendor_id == v))
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.return_window);
        if let Some(limit) = filter.limit {
            eligible.truncate(limit.max(0) as usize);
        }
        Ok(eligible)
    }

    async fn list_adjudication_queue(&self) -> EngineResult<Vec<SubOrder>> {
        let store = self.store.lock().await;
        let mut disputes: Vec<SubOrder> = store
            .orders
            .values()
            .flat_map(|o| o.sub_orders.iter())
            .filter(|s| {
                s.delivery_status.needs_adjudication()
                    && s.escrow.held
                    && s.escrow.unresolved()
            })
            .cloned()
            .collect();
        disputes.sort_by_key(|s| s.terminal_at());
        Ok(disputes)
    }
}

#[async_trait]
impl SettlementRepository for MemoryEngine {
    async fn release_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        notes: Option<String>,
        breakdown: &CommissionBreakdown,
        auto_confirmed: bool,
    ) -> EngineResult<ReleaseReceipt> {
        let mut store = self.store.lock().await;
        let now = Utc::now();

        let vendor_id = {
            let sub = store.sub_order_mut(sub_order_id)?;
            apply_release(sub, actor, notes, now, auto_confirmed)?;
            sub.vendor_id
        };

        // The credit lands while the order lock is still held, matching the
        // single-transaction semantics of the Postgres store.
        let credit = self
            .wallets
            .apply_credit(WalletTransaction::credit(
                vendor_id,
                breakdown.settle_amount,
                TxSource::EscrowRelease,
                Some(sub_order_id),
                Some("sub_order".to_string()),
                format!(
                    "escrow release: gross {} less commission {}",
                    breakdown.gross, breakdown.commission
                ),
            ))
            .await?;

        Ok(ReleaseReceipt {
            sub_order_id,
            vendor_id,
            breakdown: breakdown.clone(),
            wallet_transaction_id: credit.id,
            released_at: now,
        })
    }

    async fn refund_escrow(
        &self,
        sub_order_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> EngineResult<SubOrder> {
        let mut store = self.store.lock().await;
        let sub = store.sub_order_mut(sub_order_id)?;
        apply_refund(sub, actor, reason)?;
        Ok(sub.clone())
    }
}

#[async_trait]
impl WalletRepository for MemoryEngine {
    async fn ensure_wallet(&self, vendor_id: Uuid) -> EngineResult<Wallet> {
        self.wallets.ensure_wallet(vendor_id).await
    }

    async fn wallet(&self, vendor_id: Uuid) -> EngineResult<Option<Wallet>> {
        self.wallets.wallet(vendor_id).await
    }

    async fn transactions(
        &self,
        vendor_id: Uuid,
        filter: &TxFilter,
    ) -> EngineResult<Vec<WalletTransaction>> {
        self.wallets.transactions(vendor_id, filter).await
    }

    async fn create_withdrawal(&self, request: &WithdrawalRequest) -> EngineResult<()> {
        self.wallets.create_withdrawal(request).await
    }

    async fn withdrawal(&self, id: Uuid) -> EngineResult<Option<WithdrawalRequest>> {
        self.wallets.withdrawal(id).await
    }

    async fn list_withdrawals(
        &self,
        filter: &WithdrawalFilter,
    ) -> EngineResult<Vec<WithdrawalRequest>> {
        self.wallets.list_withdrawals(filter).await
    }

    async fn transition_withdrawal(
        &self,
        id: Uuid,
        next: WithdrawalStatus,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<WithdrawalRequest> {
        self.wallets.transition_withdrawal(id, next, actor, notes).await
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        actor: &str,
        transaction_reference: &str,
    ) -> EngineResult<WalletTransaction> {
        self.wallets
            .complete_withdrawal(id, actor, transaction_reference)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{CartLine, CheckoutRequest, CheckoutService, VendorShipping};
    use crate::escrow::SettlementService;
    use souq_core::identity::Caller;
    use souq_core::money::commission;

    async fn delivered_fixture() -> (Arc<MemoryEngine>, SettlementService, Uuid, Uuid) {
        let engine = Arc::new(MemoryEngine::new());
        let vendor_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        engine
            .seed_product(ProductSnapshot {
                product_id,
                vendor_id,
                name: "Brass Lamp".into(),
                unit_price: 6_000,
                size: None,
            })
            .await;

        let checkout = CheckoutService::new(engine.clone(), engine.clone());
        let order = checkout
            .create_order(CheckoutRequest {
                customer_id: "cust-1".into(),
                idempotency_key: "fixture-key".into(),
                shipping_address: "12 Market Lane".into(),
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
                idempotency_key: "fixture-key".into(),
                gateway_reference: "gw-1".into(),
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
        engine.confirm_delivery(sub_id, Utc::now()).await.unwrap();

        let settlement = SettlementService::new(engine.clone(), engine.clone());
        (engine, settlement, sub_id, vendor_id)
    }

    #[tokio::test]
    async fn test_release_credits_wallet_exactly_once() {
        let (engine, settlement, sub_id, vendor_id) = delivered_fixture().await;

        let receipt = settlement
            .release(sub_id, &Caller::admin("ops-1"), None)
            .await
            .unwrap();
        let expected = commission(6_000);
        assert_eq!(receipt.breakdown, expected);

        let wallet = engine.ensure_wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, expected.settle_amount);
        assert_eq!(wallet.total_earned, expected.settle_amount);
        assert_eq!(engine.wallets().reconciled_balance(vendor_id).await, wallet.balance);

        let txs = engine
            .transactions(vendor_id, &TxFilter::default())
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].related_id, Some(sub_id));

        // Second release is a conflict and writes nothing.
        let err = settlement
            .release(sub_id, &Caller::admin("ops-1"), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let wallet = engine.ensure_wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, expected.settle_amount);
    }

    #[tokio::test]
    async fn test_concurrent_release_yields_one_credit() {
        let (engine, settlement, sub_id, vendor_id) = delivered_fixture().await;
        let settlement = Arc::new(settlement);

        let a = {
            let s = settlement.clone();
            tokio::spawn(async move { s.release(sub_id, &Caller::admin("ops-a"), None).await })
        };
        let b = {
            let s = settlement.clone();
            tokio::spawn(async move { s.release(sub_id, &Caller::admin("ops-b"), None).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

        // Exactly one winner; the loser sees a conflict (or the eligibility
        // check already observed the release).
        assert!(ra.is_ok() != rb.is_ok());

        let txs = engine
            .transactions(vendor_id, &TxFilter::default())
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);

        let sub = engine.sub_order(sub_id).await.unwrap().unwrap();
        assert!(sub.escrow.released);
        assert!(!sub.escrow.refunded);
    }

    #[tokio::test]
    async fn test_release_queue_window_boundaries() {
        let (engine, settlement, sub_id, _) = delivered_fixture().await;

        // Unconfirm and push the window a day into the future: not queued.
        {
            let mut store = engine.store.lock().await;
            let sub = store.sub_order_mut(sub_id).unwrap();
            sub.confirmation.confirmed = false;
            sub.confirmation.confirmed_at = None;
            sub.return_window = Some(Utc::now() + chrono::Duration::days(1));
        }
        let queue = settlement.release_queue(&ReleaseFilter::default()).await.unwrap();
        assert!(queue.is_empty());

        // Window lapsed a day ago: queued.
        {
            let mut store = engine.store.lock().await;
            let sub = store.sub_order_mut(sub_id).unwrap();
            sub.return_window = Some(Utc::now() - chrono::Duration::days(1));
        }
        let queue = settlement.release_queue(&ReleaseFilter::default()).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, sub_id);
    }

    #[tokio::test]
    async fn test_auto_release_marks_auto_confirmed() {
        let (engine, settlement, sub_id, _) = delivered_fixture().await;
        {
            let mut store = engine.store.lock().await;
            let sub = store.sub_order_mut(sub_id).unwrap();
            sub.confirmation.confirmed = false;
            sub.confirmation.confirmed_at = None;
            sub.return_window = Some(Utc::now() - chrono::Duration::days(1));
        }

        settlement
            .release(sub_id, &Caller::system(), None)
            .await
            .unwrap();
        let sub = engine.sub_order(sub_id).await.unwrap().unwrap();
        assert!(sub.confirmation.confirmed);
        assert!(sub.confirmation.auto_confirmed);
    }
}
