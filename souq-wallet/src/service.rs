//! Vendor wallet and withdrawal-request workflow.

use std::sync::Arc;

use uuid::Uuid;

use souq_core::identity::Caller;
use souq_core::money::{withdrawal_fee, FeePolicy};
use souq_core::{EngineError, EngineResult};

use crate::models::{
    BankAccountSnapshot, TxFilter, Wallet, WalletTransaction, WithdrawalFilter,
    WithdrawalRequest, WithdrawalStatus,
};
use crate::repository::WalletRepository;

pub struct WalletService {
    repo: Arc<dyn WalletRepository>,
    fees: FeePolicy,
}

impl WalletService {
    pub fn new(repo: Arc<dyn WalletRepository>, fees: FeePolicy) -> Self {
        Self { repo, fees }
    }

    pub async fn wallet(&self, vendor_id: Uuid) -> EngineResult<Wallet> {
        self.repo.ensure_wallet(vendor_id).await
    }

    pub async fn transactions(
        &self,
        vendor_id: Uuid,
        filter: &TxFilter,
    ) -> EngineResult<Vec<WalletTransaction>> {
        self.repo.transactions(vendor_id, filter).await
    }

    pub async fn withdrawal(&self, id: Uuid) -> EngineResult<WithdrawalRequest> {
        self.repo
            .withdrawal(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))
    }

    pub async fn list_withdrawals(
        &self,
        filter: &WithdrawalFilter,
    ) -> EngineResult<Vec<WithdrawalRequest>> {
        self.repo.list_withdrawals(filter).await
    }

    /// File a payout request against the wallet balance.
    ///
    /// The balance is validated here but not debited; only Completion moves
    /// money, so "funds requested" and "funds moved" stay distinct events.
    pub async fn create_withdrawal(
        &self,
        caller: &Caller,
        vendor_id: Uuid,
        amount: i64,
        bank_account: BankAccountSnapshot,
    ) -> EngineResult<WithdrawalRequest> {
        if amount <= 0 {
            return Err(EngineError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }

        let wallet = self.repo.ensure_wallet(vendor_id).await?;
        if amount > wallet.balance {
            return Err(EngineError::InsufficientFunds {
                requested: amount,
                available: wallet.balance,
            });
        }

        let fee = withdrawal_fee(amount, &self.fees);
        if fee >= amount {
            return Err(EngineError::Validation(format!(
                "requested amount {amount} does not cover the {fee} processing fee"
            )));
        }

        let request =
            WithdrawalRequest::new(vendor_id, amount, fee, bank_account, &caller.audit_tag());
        self.repo.create_withdrawal(&request).await?;

        tracing::info!(
            withdrawal_id = %request.id,
            vendor_id = %vendor_id,
            amount,
            fee,
            "withdrawal request created"
        );
        Ok(request)
    }

    pub async fn begin_review(&self, caller: &Caller, id: Uuid) -> EngineResult<WithdrawalRequest> {
        self.repo
            .transition_withdrawal(id, WithdrawalStatus::UnderReview, &caller.audit_tag(), None)
            .await
    }

    /// Approve a request. Sufficient balance is re-verified inside the store
    /// transaction: a release or another payout may have changed the balance
    /// since the request was filed.
    pub async fn approve(
        &self,
        caller: &Caller,
        id: Uuid,
        notes: Option<String>,
    ) -> EngineResult<WithdrawalRequest> {
        let request = self
            .repo
            .transition_withdrawal(id, WithdrawalStatus::Approved, &caller.audit_tag(), notes)
            .await?;
        tracing::info!(withdrawal_id = %id, "withdrawal approved");
        Ok(request)
    }

    pub async fn reject(
        &self,
        caller: &Caller,
        id: Uuid,
        reason: String,
    ) -> EngineResult<WithdrawalRequest> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "a rejection reason is required".to_string(),
            ));
        }
        let request = self
            .repo
            .transition_withdrawal(
                id,
                WithdrawalStatus::Rejected,
                &caller.audit_tag(),
                Some(reason),
            )
            .await?;
        tracing::warn!(withdrawal_id = %id, "withdrawal rejected");
        Ok(request)
    }

    pub async fn start_processing(
        &self,
        caller: &Caller,
        id: Uuid,
    ) -> EngineResult<WithdrawalRequest> {
        self.repo
            .transition_withdrawal(id, WithdrawalStatus::Processing, &caller.audit_tag(), None)
            .await
    }

    /// The external payout succeeded: record the gateway reference, debit
    /// the wallet and write the ledger row, all in one transaction.
    pub async fn complete(
        &self,
        caller: &Caller,
        id: Uuid,
        transaction_reference: String,
    ) -> EngineResult<WalletTransaction> {
        if transaction_reference.trim().is_empty() {
            return Err(EngineError::Validation(
                "a payout transaction reference is required".to_string(),
            ));
        }
        let debit = self
            .repo
            .complete_withdrawal(id, &caller.audit_tag(), &transaction_reference)
            .await?;
        tracing::info!(
            withdrawal_id = %id,
            amount = debit.amount,
            reference = %transaction_reference,
            "withdrawal completed"
        );
        Ok(debit)
    }

    /// The external payout failed; the wallet is left untouched.
    pub async fn fail(
        &self,
        caller: &Caller,
        id: Uuid,
        reason: String,
    ) -> EngineResult<WithdrawalRequest> {
        let request = self
            .repo
            .transition_withdrawal(
                id,
                WithdrawalStatus::Failed,
                &caller.audit_tag(),
                Some(reason),
            )
            .await?;
        tracing::warn!(withdrawal_id = %id, "withdrawal payout failed");
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWallets;
    use crate::models::TxSource;

    fn bank() -> BankAccountSnapshot {
        BankAccountSnapshot {
            bank_name: "First Bank".into(),
            account_name: "Acme Goods".into(),
            account_number: "0001112223".into(),
        }
    }

    async fn service_with_balance(balance: i64) -> (WalletService, Arc<MemoryWallets>, Uuid) {
        let wallets = Arc::new(MemoryWallets::new());
        let vendor_id = Uuid::new_v4();
        wallets.seed_balance(vendor_id, balance).await;
        let service = WalletService::new(wallets.clone(), FeePolicy::default());
        (service, wallets, vendor_id)
    }

    #[tokio::test]
    async fn test_create_withdrawal_over_balance() {
        let (service, _, vendor_id) = service_with_balance(10_000).await;
        let admin = Caller::vendor(vendor_id.to_string());

        let err = service
            .create_withdrawal(&admin, vendor_id, 10_001, bank())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                requested: 10_001,
                available: 10_000
            }
        ));

        // Exactly the balance is accepted.
        let req = service
            .create_withdrawal(&admin, vendor_id, 10_000, bank())
            .await
            .unwrap();
        assert_eq!(req.requested_amount, 10_000);
        assert_eq!(req.net_amount, 10_000 - req.processing_fee);
    }

    #[tokio::test]
    async fn test_completion_debits_exactly_once() {
        let (service, wallets, vendor_id) = service_with_balance(10_000).await;
        let vendor = Caller::vendor(vendor_id.to_string());
        let admin = Caller::admin("ops-1");

        let req = service
            .create_withdrawal(&vendor, vendor_id, 4_000, bank())
            .await
            .unwrap();
        service.begin_review(&admin, req.id).await.unwrap();
        service.approve(&admin, req.id, None).await.unwrap();
        service.start_processing(&admin, req.id).await.unwrap();

        let debit = service
            .complete(&admin, req.id, "gw-ref-77".into())
            .await
            .unwrap();
        assert_eq!(debit.amount, 4_000);
        assert_eq!(debit.source, TxSource::WithdrawalPayout);

        let wallet = service.wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, 6_000);

        // Double completion must not produce a second debit.
        let err = service
            .complete(&admin, req.id, "gw-ref-77".into())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let txs = wallets
            .transactions(
                vendor_id,
                &TxFilter {
                    tx_type: Some(crate::models::TxType::Debit),
                    ..TxFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[tokio::test]
    async fn test_approvals_cannot_jointly_overdraft() {
        let (service, _, vendor_id) = service_with_balance(10_000).await;
        let vendor = Caller::vendor(vendor_id.to_string());
        let admin = Caller::admin("ops-1");

        // Two requests, each for 60% of the balance, are both accepted.
        let a = service
            .create_withdrawal(&vendor, vendor_id, 6_000, bank())
            .await
            .unwrap();
        let b = service
            .create_withdrawal(&vendor, vendor_id, 6_000, bank())
            .await
            .unwrap();

        // Approving the first claims its amount even though nothing has been
        // debited yet...
        service.begin_review(&admin, a.id).await.unwrap();
        service.approve(&admin, a.id, None).await.unwrap();

        // ...so the second cannot also reach Approved.
        service.begin_review(&admin, b.id).await.unwrap();
        let err = service.approve(&admin, b.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                requested: 6_000,
                available: 4_000
            }
        ));

        // Completing the winner leaves the wallet non-negative.
        service.start_processing(&admin, a.id).await.unwrap();
        service.complete(&admin, a.id, "gw-1".into()).await.unwrap();
        let wallet = service.wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, 4_000);
    }

    #[tokio::test]
    async fn test_failed_payout_releases_its_claim() {
        let (service, _, vendor_id) = service_with_balance(10_000).await;
        let vendor = Caller::vendor(vendor_id.to_string());
        let admin = Caller::admin("ops-1");

        let a = service
            .create_withdrawal(&vendor, vendor_id, 6_000, bank())
            .await
            .unwrap();
        let b = service
            .create_withdrawal(&vendor, vendor_id, 6_000, bank())
            .await
            .unwrap();

        service.begin_review(&admin, a.id).await.unwrap();
        service.approve(&admin, a.id, None).await.unwrap();
        service.begin_review(&admin, b.id).await.unwrap();
        assert!(service.approve(&admin, b.id, None).await.is_err());

        // The failed payout moved no money, so its claim is gone and the
        // second request can now be approved.
        service.start_processing(&admin, a.id).await.unwrap();
        service
            .fail(&admin, a.id, "bank rejected the transfer".into())
            .await
            .unwrap();
        let approved = service.approve(&admin, b.id, None).await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Approved);

        let wallet = service.wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, 10_000);
    }

    #[tokio::test]
    async fn test_rejection_requires_reason_and_moves_no_money() {
        let (service, _, vendor_id) = service_with_balance(5_000).await;
        let vendor = Caller::vendor(vendor_id.to_string());
        let admin = Caller::admin("ops-1");

        let req = service
            .create_withdrawal(&vendor, vendor_id, 2_000, bank())
            .await
            .unwrap();

        let err = service.reject(&admin, req.id, "  ".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let rejected = service
            .reject(&admin, req.id, "bank account mismatch".into())
            .await
            .unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert_eq!(
            rejected.review.as_ref().unwrap().rejection_reason.as_deref(),
            Some("bank account mismatch")
        );

        let wallet = service.wallet(vendor_id).await.unwrap();
        assert_eq!(wallet.balance, 5_000);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_conflict() {
        let (service, _, vendor_id) = service_with_balance(5_000).await;
        let vendor = Caller::vendor(vendor_id.to_string());
        let admin = Caller::admin("ops-1");

        let req = service
            .create_withdrawal(&vendor, vendor_id, 2_000, bank())
            .await
            .unwrap();

        // Pending cannot jump straight to Processing.
        let err = service.start_processing(&admin, req.id).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
