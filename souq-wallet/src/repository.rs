//! Wallet persistence contract.
//!
//! Multi-entity mutations (approval balance re-check, completion debit) are
//! trait methods so the implementation owns the transaction boundary; the
//! service never sees a partially-applied payout.

use async_trait::async_trait;
use uuid::Uuid;

use souq_core::EngineResult;

use crate::models::{
    TxFilter, Wallet, WalletTransaction, WithdrawalFilter, WithdrawalRequest, WithdrawalStatus,
};

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Fetch the vendor's wallet, creating an empty one on first use.
    async fn ensure_wallet(&self, vendor_id: Uuid) -> EngineResult<Wallet>;

    async fn wallet(&self, vendor_id: Uuid) -> EngineResult<Option<Wallet>>;

    /// Ledger rows for a vendor, newest first.
    async fn transactions(
        &self,
        vendor_id: Uuid,
        filter: &TxFilter,
    ) -> EngineResult<Vec<WalletTransaction>>;

    async fn create_withdrawal(&self, request: &WithdrawalRequest) -> EngineResult<()>;

    async fn withdrawal(&self, id: Uuid) -> EngineResult<Option<WithdrawalRequest>>;

    async fn list_withdrawals(
        &self,
        filter: &WithdrawalFilter,
    ) -> EngineResult<Vec<WithdrawalRequest>>;

    /// Move a withdrawal to `next`, appending history and recording
    /// review/processing details. The state machine is re-validated inside
    /// the transaction; a transition to Approved additionally re-checks
    /// `requested_amount <= balance` so concurrent pending requests cannot
    /// jointly overdraft the wallet.
    async fn transition_withdrawal(
        &self,
        id: Uuid,
        next: WithdrawalStatus,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<WithdrawalRequest>;

    /// Processing -> Completed: in one transaction, insert the Debit ledger
    /// row, decrement the balance and record the gateway's transaction
    /// reference. Double completion is a Conflict, never a second debit.
    async fn complete_withdrawal(
        &self,
        id: Uuid,
        actor: &str,
        transaction_reference: &str,
    ) -> EngineResult<WalletTransaction>;
}
