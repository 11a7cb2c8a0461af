use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One wallet per vendor. The balance is never written directly: every
/// change is the consequence of exactly one `WalletTransaction` row, so
/// `balance == sum(credits) - sum(debits)` must always reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub vendor_id: Uuid,
    pub balance: i64,
    pub pending: i64,
    pub total_earned: i64,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(vendor_id: Uuid) -> Self {
        Self {
            vendor_id,
            balance: 0,
            pending: 0,
            total_earned: 0,
            currency: "USD".to_string(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Credit,
    Debit,
}

/// What moved the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxSource {
    EscrowRelease,
    Refund,
    WithdrawalPayout,
    Adjustment,
}

/// Immutable ledger row. Amounts are always positive; direction lives in
/// `tx_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub tx_type: TxType,
    pub amount: i64,
    pub source: TxSource,
    pub related_id: Option<Uuid>,
    pub related_type: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn credit(
        vendor_id: Uuid,
        amount: i64,
        source: TxSource,
        related_id: Option<Uuid>,
        related_type: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            tx_type: TxType::Credit,
            amount,
            source,
            related_id,
            related_type,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    pub fn debit(
        vendor_id: Uuid,
        amount: i64,
        source: TxSource,
        related_id: Option<Uuid>,
        related_type: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            tx_type: TxType::Debit,
            amount,
            source,
            related_id,
            related_type,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Signed contribution to the wallet balance.
    pub fn signed_amount(&self) -> i64 {
        match self.tx_type {
            TxType::Credit => self.amount,
            TxType::Debit => -self.amount,
        }
    }
}

/// Bank details captured at request time; later edits to the vendor's bank
/// account must not change an in-flight payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankAccountSnapshot {
    pub bank_name: String,
    pub account_name: String,
    pub account_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    UnderReview,
    Approved,
    Processing,
    Completed,
    Rejected,
    Failed,
}

impl WithdrawalStatus {
    /// The payout state machine:
    /// Pending -> UnderReview -> Approved -> Processing -> Completed;
    /// Pending | UnderReview -> Rejected; Processing -> Failed.
    pub fn may_become(&self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Pending, UnderReview)
                | (Pending, Rejected)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                | (Approved, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Completed | WithdrawalStatus::Rejected | WithdrawalStatus::Failed
        )
    }
}

/// Append-only history entry for a withdrawal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalEntry {
    pub status: WithdrawalStatus,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    pub processed_by: String,
    pub processed_at: DateTime<Utc>,
    pub transaction_reference: Option<String>,
}

/// A vendor-initiated conversion of wallet balance into an external payout.
/// The balance is only debited at Completion; rejection and failure leave
/// the wallet untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub requested_amount: i64,
    pub processing_fee: i64,
    pub net_amount: i64,
    pub bank_account: BankAccountSnapshot,
    pub status: WithdrawalStatus,
    pub status_history: Vec<WithdrawalEntry>,
    pub review: Option<Review>,
    pub processing: Option<Processing>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    pub fn new(
        vendor_id: Uuid,
        requested_amount: i64,
        processing_fee: i64,
        bank_account: BankAccountSnapshot,
        actor: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            requested_amount,
            processing_fee,
            net_amount: requested_amount - processing_fee,
            bank_account,
            status: WithdrawalStatus::Pending,
            status_history: vec![WithdrawalEntry {
                status: WithdrawalStatus::Pending,
                at: now,
                actor: actor.to_string(),
                notes: None,
            }],
            review: None,
            processing: None,
            created_at: now,
        }
    }

    pub fn append_status(&mut self, status: WithdrawalStatus, actor: &str, notes: Option<String>) {
        self.status = status;
        self.status_history.push(WithdrawalEntry {
            status,
            at: Utc::now(),
            actor: actor.to_string(),
            notes,
        });
    }
}

/// Ledger listing filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxFilter {
    pub tx_type: Option<TxType>,
    pub source: Option<TxSource>,
    pub limit: Option<i64>,
}

/// Withdrawal listing filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalFilter {
    pub vendor_id: Option<Uuid>,
    pub status: Option<WithdrawalStatus>,
}
