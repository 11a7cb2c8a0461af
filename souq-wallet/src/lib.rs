pub mod memory;
pub mod models;
pub mod repository;
pub mod service;

pub use models::{
    BankAccountSnapshot, TxFilter, TxSource, TxType, Wallet, WalletTransaction,
    WithdrawalFilter, WithdrawalRequest, WithdrawalStatus,
};
pub use repository::WalletRepository;
pub use service::WalletService;
