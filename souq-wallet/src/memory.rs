//! In-memory `WalletRepository`.
//!
//! The mutex scope stands in for the database transaction: every guard
//! re-check (state machine, approval balance, completion debit) happens
//! under the lock, so concurrency tests exercise the same exclusion the
//! Postgres store gets from row-level updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use souq_core::{EngineError, EngineResult};

use crate::models::{
    Processing, Review, TxFilter, TxSource, Wallet, WalletTransaction, WithdrawalFilter,
    WithdrawalRequest, WithdrawalStatus,
};
use crate::repository::WalletRepository;

#[derive(Default)]
struct Bank {
    wallets: HashMap<Uuid, Wallet>,
    transactions: Vec<WalletTransaction>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
}

#[derive(Clone, Default)]
pub struct MemoryWallets {
    inner: Arc<Mutex<Bank>>,
}

impl MemoryWallets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance through an Adjustment credit so the reconciliation
    /// invariant holds even for fixtures.
    pub async fn seed_balance(&self, vendor_id: Uuid, amount: i64) {
        let mut bank = self.inner.lock().await;
        Self::credit_locked(
            &mut bank,
            WalletTransaction::credit(
                vendor_id,
                amount,
                TxSource::Adjustment,
                None,
                None,
                "seed balance",
            ),
        );
    }

    /// Apply a Credit ledger row and bump the balance; used by the order
    /// engine's escrow release under its own transaction lock.
    pub async fn apply_credit(&self, tx: WalletTransaction) -> EngineResult<WalletTransaction> {
        let mut bank = self.inner.lock().await;
        Ok(Self::credit_locked(&mut bank, tx))
    }

    /// Recompute a balance from the ledger; test support for the
    /// reconciliation invariant.
    pub async fn reconciled_balance(&self, vendor_id: Uuid) -> i64 {
        let bank = self.inner.lock().await;
        bank.transactions
            .iter()
            .filter(|t| t.vendor_id == vendor_id)
            .map(|t| t.signed_amount())
            .sum()
    }

    fn credit_locked(bank: &mut Bank, tx: WalletTransaction) -> WalletTransaction {
        let wallet = bank
            .wallets
            .entry(tx.vendor_id)
            .or_insert_with(|| Wallet::new(tx.vendor_id));
        wallet.balance += tx.amount;
        wallet.total_earned += tx.amount;
        wallet.updated_at = Utc::now();
        bank.transactions.push(tx.clone());
        tx
    }
}

#[async_trait]
impl WalletRepository for MemoryWallets {
    async fn ensure_wallet(&self, vendor_id: Uuid) -> EngineResult<Wallet> {
        let mut bank = self.inner.lock().await;
        Ok(bank
            .wallets
            .entry(vendor_id)
            .or_insert_with(|| Wallet::new(vendor_id))
            .clone())
    }

    async fn wallet(&self, vendor_id: Uuid) -> EngineResult<Option<Wallet>> {
        let bank = self.inner.lock().await;
        Ok(bank.wallets.get(&vendor_id).cloned())
    }

    async fn transactions(
        &self,
        vendor_id: Uuid,
        filter: &TxFilter,
    ) -> EngineResult<Vec<WalletTransaction>> {
        let bank = self.inner.lock().await;
        let mut rows: Vec<WalletTransaction> = bank
            .transactions
            .iter()
            .filter(|t| t.vendor_id == vendor_id)
            .filter(|t| filter.tx_type.map_or(true, |ty| t.tx_type == ty))
            .filter(|t| filter.source.map_or(true, |s| t.source == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn create_withdrawal(&self, request: &WithdrawalRequest) -> EngineResult<()> {
        let mut bank = self.inner.lock().await;
        bank.withdrawals.insert(request.id, request.clone());
        Ok(())
    }

    async fn withdrawal(&self, id: Uuid) -> EngineResult<Option<WithdrawalRequest>> {
        let bank = self.inner.lock().await;
        Ok(bank.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals(
        &self,
        filter: &WithdrawalFilter,
    ) -> EngineResult<Vec<WithdrawalRequest>> {
        let bank = self.inner.lock().await;
        let mut rows: Vec<WithdrawalRequest> = bank
            .withdrawals
            .values()
            .filter(|w| filter.vendor_id.map_or(true, |v| w.vendor_id == v))
            .filter(|w| filter.status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn transition_withdrawal(
        &self,
        id: Uuid,
        next: WithdrawalStatus,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<WithdrawalRequest> {
        let mut bank = self.inner.lock().await;

        let available = {
            let request = bank
                .withdrawals
                .get(&id)
                .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))?;
            if !request.status.may_become(next) {
                return Err(EngineError::Conflict(format!(
                    "withdrawal {id} cannot move {:?} -> {:?}",
                    request.status, next
                )));
            }
            let balance = bank
                .wallets
                .get(&request.vendor_id)
                .map(|w| w.balance)
                .unwrap_or(0);
            // Approved or Processing requests still hold a claim on the
            // balance until they complete or fail.
            let outstanding: i64 = bank
                .withdrawals
                .values()
                .filter(|w| w.vendor_id == request.vendor_id && w.id != id)
                .filter(|w| {
                    matches!(
                        w.status,
                        WithdrawalStatus::Approved | WithdrawalStatus::Processing
                    )
                })
                .map(|w| w.requested_amount)
                .sum();
            balance - outstanding
        };

        let request = bank
            .withdrawals
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))?;

        match next {
            WithdrawalStatus::Approved => {
                // Approval-time re-check: balance may have moved since the
                // request was filed.
                if request.requested_amount > available {
                    return Err(EngineError::InsufficientFunds {
                        requested: request.requested_amount,
                        available,
                    });
                }
                let review = request.review.get_or_insert_with(|| Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: Utc::now(),
                    notes: None,
                    rejection_reason: None,
                });
                review.reviewed_by = actor.to_string();
                review.reviewed_at = Utc::now();
                review.notes = notes.clone();
            }
            WithdrawalStatus::UnderReview => {
                request.review = Some(Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: Utc::now(),
                    notes: None,
                    rejection_reason: None,
                });
            }
            WithdrawalStatus::Rejected => {
                let review = request.review.get_or_insert_with(|| Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: Utc::now(),
                    notes: None,
                    rejection_reason: None,
                });
                review.rejection_reason = notes.clone();
            }
            WithdrawalStatus::Processing => {
                request.processing = Some(Processing {
                    processed_by: actor.to_string(),
                    processed_at: Utc::now(),
                    transaction_reference: None,
                });
            }
            _ => {}
        }

        request.append_status(next, actor, notes);
        Ok(request.clone())
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        actor: &str,
        transaction_reference: &str,
    ) -> EngineResult<WalletTransaction> {
        let mut bank = self.inner.lock().await;

        let (vendor_id, amount) = {
            let request = bank
                .withdrawals
                .get(&id)
                .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))?;
            // Guard re-read under the lock: only a Processing request may
            // complete, so a concurrent duplicate call loses here.
            if request.status != WithdrawalStatus::Completed
                && !request.status.may_become(WithdrawalStatus::Completed)
            {
                return Err(EngineError::Conflict(format!(
                    "withdrawal {id} cannot complete from {:?}",
                    request.status
                )));
            }
            if request.status == WithdrawalStatus::Completed {
                return Err(EngineError::Conflict(format!(
                    "withdrawal {id} already completed"
                )));
            }
            (request.vendor_id, request.requested_amount)
        };

        let debit = WalletTransaction::debit(
            vendor_id,
            amount,
            TxSource::WithdrawalPayout,
            Some(id),
            Some("withdrawal_request".to_string()),
            format!("payout {transaction_reference}"),
        );

        let wallet = bank
            .wallets
            .get_mut(&vendor_id)
            .ok_or_else(|| EngineError::NotFound(format!("wallet for vendor {vendor_id}")))?;
        wallet.balance -= amount;
        wallet.updated_at = Utc::now();
        bank.transactions.push(debit.clone());

        let request = bank
            .withdrawals
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))?;
        if let Some(processing) = request.processing.as_mut() {
            processing.transaction_reference = Some(transaction_reference.to_string());
        }
        request.append_status(
            WithdrawalStatus::Completed,
            actor,
            Some(format!("payout reference {transaction_reference}")),
        );

        Ok(debit)
    }
}
