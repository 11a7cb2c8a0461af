use std::sync::Arc;

use souq_order::{AdjudicationService, CheckoutService, OrderRepository, SettlementService};
use souq_wallet::service::WalletService;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<dyn OrderRepository>,
    pub checkout: Arc<CheckoutService>,
    pub settlement: Arc<SettlementService>,
    pub adjudication: Arc<AdjudicationService>,
    pub wallets: Arc<WalletService>,
    pub auth: AuthConfig,
    pub return_window_days: i64,
}
