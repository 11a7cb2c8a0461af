pub mod app_config;
pub mod catalog_repo;
pub mod database;
pub mod order_repo;
pub mod wallet_repo;

pub use catalog_repo::PgCatalog;
pub use database::DbClient;
pub use order_repo::PgOrderRepository;
pub use wallet_repo::PgWalletRepository;

use souq_core::EngineError;

/// Map a database failure onto the engine's error taxonomy. Unique-key
/// violations surface as Conflict so idempotent creations report correctly.
pub(crate) fn db_err(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return EngineError::Conflict(db.message().to_string());
        }
    }
    EngineError::Internal(format!("database error: {e}"))
}
