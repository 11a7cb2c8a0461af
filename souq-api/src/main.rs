use std::net::SocketAddr;
use std::sync::Arc;

use souq_api::{app, state::{AppState, AuthConfig}, worker};
use souq_core::money::FeePolicy;
use souq_order::{
    AdjudicationService, CheckoutService, OrderRepository, SettlementRepository,
    SettlementService,
};
use souq_store::{DbClient, PgCatalog, PgOrderRepository, PgWalletRepository};
use souq_wallet::service::WalletService;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "souq_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = souq_store::app_config::Config::load().expect("Failed to load config");
    tracing::info!("Starting Souq API on port {}", config.server.port);

    let db = DbClient::new(&config.database.url)
        .await
        .expect("Failed to connect to Postgres");
    db.migrate().await.expect("Failed to run migrations");

    let order_repo = Arc::new(PgOrderRepository::new(db.pool.clone()));
    let orders: Arc<dyn OrderRepository> = order_repo.clone();
    let settlement_repo: Arc<dyn SettlementRepository> = order_repo;
    let catalog = Arc::new(PgCatalog::new(db.pool.clone()));

    let checkout = Arc::new(CheckoutService::new(catalog, orders.clone()));
    let settlement = Arc::new(SettlementService::new(
        orders.clone(),
        settlement_repo.clone(),
    ));
    let adjudication = Arc::new(AdjudicationService::new(
        orders.clone(),
        settlement_repo,
        settlement.clone(),
    ));
    let wallets = Arc::new(WalletService::new(
        Arc::new(PgWalletRepository::new(db.pool.clone())),
        FeePolicy {
            fee_bps: config.settlement.withdrawal_fee_bps,
            fee_min: config.settlement.withdrawal_fee_min,
        },
    ));

    tokio::spawn(worker::start_release_sweep(
        settlement.clone(),
        config.settlement.sweep_interval_seconds,
    ));

    let app_state = AppState {
        orders,
        checkout,
        settlement,
        adjudication,
        wallets,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
        return_window_days: config.settlement.return_window_days,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
