//! Postgres `WalletRepository`.
//!
//! The wallet row is locked `FOR UPDATE` wherever money moves: approval
//! re-checks the balance under that lock, completion debits under it, so
//! concurrent payouts can never jointly overdraft a wallet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use souq_core::{EngineError, EngineResult};
use souq_wallet::models::{
    BankAccountSnapshot, Processing, Review, TxFilter, TxSource, TxType, Wallet,
    WalletTransaction, WithdrawalEntry, WithdrawalFilter, WithdrawalRequest, WithdrawalStatus,
};
use souq_wallet::repository::WalletRepository;

use crate::db_err;

pub struct PgWalletRepository {
    pool: PgPool,
}

impl PgWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn tx_type_str(t: TxType) -> &'static str {
    match t {
        TxType::Credit => "CREDIT",
        TxType::Debit => "DEBIT",
    }
}

fn parse_tx_type(s: &str) -> EngineResult<TxType> {
    match s {
        "CREDIT" => Ok(TxType::Credit),
        "DEBIT" => Ok(TxType::Debit),
        other => Err(EngineError::Internal(format!(
            "unknown transaction type '{other}'"
        ))),
    }
}

fn tx_source_str(s: TxSource) -> &'static str {
    match s {
        TxSource::EscrowRelease => "ESCROW_RELEASE",
        TxSource::Refund => "REFUND",
        TxSource::WithdrawalPayout => "WITHDRAWAL_PAYOUT",
        TxSource::Adjustment => "ADJUSTMENT",
    }
}

fn parse_tx_source(s: &str) -> EngineResult<TxSource> {
    match s {
        "ESCROW_RELEASE" => Ok(TxSource::EscrowRelease),
        "REFUND" => Ok(TxSource::Refund),
        "WITHDRAWAL_PAYOUT" => Ok(TxSource::WithdrawalPayout),
        "ADJUSTMENT" => Ok(TxSource::Adjustment),
        other => Err(EngineError::Internal(format!(
            "unknown transaction source '{other}'"
        ))),
    }
}

fn withdrawal_status_str(s: WithdrawalStatus) -> &'static str {
    match s {
        WithdrawalStatus::Pending => "PENDING",
        WithdrawalStatus::UnderReview => "UNDER_REVIEW",
        WithdrawalStatus::Approved => "APPROVED",
        WithdrawalStatus::Processing => "PROCESSING",
        WithdrawalStatus::Completed => "COMPLETED",
        WithdrawalStatus::Rejected => "REJECTED",
        WithdrawalStatus::Failed => "FAILED",
    }
}

fn parse_withdrawal_status(s: &str) -> EngineResult<WithdrawalStatus> {
    match s {
        "PENDING" => Ok(WithdrawalStatus::Pending),
        "UNDER_REVIEW" => Ok(WithdrawalStatus::UnderReview),
        "APPROVED" => Ok(WithdrawalStatus::Approved),
        "PROCESSING" => Ok(WithdrawalStatus::Processing),
        "COMPLETED" => Ok(WithdrawalStatus::Completed),
        "REJECTED" => Ok(WithdrawalStatus::Rejected),
        "FAILED" => Ok(WithdrawalStatus::Failed),
        other => Err(EngineError::Internal(format!(
            "unknown withdrawal status '{other}'"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct WalletRow {
    vendor_id: Uuid,
    balance: i64,
    pending: i64,
    total_earned: i64,
    currency: String,
    updated_at: DateTime<Utc>,
}

impl WalletRow {
    fn into_wallet(self) -> Wallet {
        Wallet {
            vendor_id: self.vendor_id,
            balance: self.balance,
            pending: self.pending,
            total_earned: self.total_earned,
            currency: self.currency,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TxRow {
    id: Uuid,
    vendor_id: Uuid,
    tx_type: String,
    amount: i64,
    source: String,
    related_id: Option<Uuid>,
    related_type: Option<String>,
    description: String,
    created_at: DateTime<Utc>,
}

impl TxRow {
    fn into_transaction(self) -> EngineResult<WalletTransaction> {
        Ok(WalletTransaction {
            id: self.id,
            vendor_id: self.vendor_id,
            tx_type: parse_tx_type(&self.tx_type)?,
            amount: self.amount,
            source: parse_tx_source(&self.source)?,
            related_id: self.related_id,
            related_type: self.related_type,
            description: self.description,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    vendor_id: Uuid,
    requested_amount: i64,
    processing_fee: i64,
    net_amount: i64,
    bank_name: String,
    account_name: String,
    account_number: String,
    status: String,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    review_notes: Option<String>,
    rejection_reason: Option<String>,
    processed_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    transaction_reference: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct WithdrawalEventRow {
    status: String,
    actor: String,
    notes: Option<String>,
    at: DateTime<Utc>,
}

const WITHDRAWAL_COLUMNS: &str = "id, vendor_id, requested_amount, processing_fee, net_amount, \
     bank_name, account_name, account_number, status, reviewed_by, reviewed_at, \
     review_notes, rejection_reason, processed_by, processed_at, \
     transaction_reference, created_at";

fn request_from_parts(
    row: WithdrawalRow,
    events: Vec<WithdrawalEventRow>,
) -> EngineResult<WithdrawalRequest> {
    let mut history = Vec::with_capacity(events.len());
    for e in events {
        history.push(WithdrawalEntry {
            status: parse_withdrawal_status(&e.status)?,
            at: e.at,
            actor: e.actor,
            notes: e.notes,
        });
    }

    let review = match (&row.reviewed_by, row.reviewed_at) {
        (Some(by), Some(at)) => Some(Review {
            reviewed_by: by.clone(),
            reviewed_at: at,
            notes: row.review_notes.clone(),
            rejection_reason: row.rejection_reason.clone(),
        }),
        _ => None,
    };
    let processing = match (&row.processed_by, row.processed_at) {
        (Some(by), Some(at)) => Some(Processing {
            processed_by: by.clone(),
            processed_at: at,
            transaction_reference: row.transaction_reference.clone(),
        }),
        _ => None,
    };

    Ok(WithdrawalRequest {
        id: row.id,
        vendor_id: row.vendor_id,
        requested_amount: row.requested_amount,
        processing_fee: row.processing_fee,
        net_amount: row.net_amount,
        bank_account: BankAccountSnapshot {
            bank_name: row.bank_name,
            account_name: row.account_name,
            account_number: row.account_number,
        },
        status: parse_withdrawal_status(&row.status)?,
        status_history: history,
        review,
        processing,
        created_at: row.created_at,
    })
}

impl PgWalletRepository {
    async fn events_for(
        tx: &mut Transaction<'_, Postgres>,
        withdrawal_id: Uuid,
    ) -> EngineResult<Vec<WithdrawalEventRow>> {
        sqlx::query_as::<_, WithdrawalEventRow>(
            "SELECT status, actor, notes, at FROM withdrawal_events WHERE withdrawal_id = $1 ORDER BY seq",
        )
        .bind(withdrawal_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn events_for_pool(&self, withdrawal_id: Uuid) -> EngineResult<Vec<WithdrawalEventRow>> {
        sqlx::query_as::<_, WithdrawalEventRow>(
            "SELECT status, actor, notes, at FROM withdrawal_events WHERE withdrawal_id = $1 ORDER BY seq",
        )
        .bind(withdrawal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn lock_request(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> EngineResult<WithdrawalRequest> {
        let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EngineError::NotFound(format!("withdrawal request {id}")))?;
        let events = Self::events_for(tx, id).await?;
        request_from_parts(row, events)
    }

    /// Write back the mutable request columns.
    async fn store_request(
        tx: &mut Transaction<'_, Postgres>,
        request: &WithdrawalRequest,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE withdrawal_requests SET status = $2, reviewed_by = $3, reviewed_at = $4,
                    review_notes = $5, rejection_reason = $6, processed_by = $7,
                    processed_at = $8, transaction_reference = $9, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(request.id)
        .bind(withdrawal_status_str(request.status))
        .bind(request.review.as_ref().map(|r| r.reviewed_by.clone()))
        .bind(request.review.as_ref().map(|r| r.reviewed_at))
        .bind(request.review.as_ref().and_then(|r| r.notes.clone()))
        .bind(request.review.as_ref().and_then(|r| r.rejection_reason.clone()))
        .bind(request.processing.as_ref().map(|p| p.processed_by.clone()))
        .bind(request.processing.as_ref().map(|p| p.processed_at))
        .bind(
            request
                .processing
                .as_ref()
                .and_then(|p| p.transaction_reference.clone()),
        )
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_events(
        tx: &mut Transaction<'_, Postgres>,
        request: &WithdrawalRequest,
        from_seq: usize,
    ) -> EngineResult<()> {
        for (seq, entry) in request.status_history.iter().enumerate().skip(from_seq) {
            sqlx::query(
                "INSERT INTO withdrawal_events (withdrawal_id, seq, status, actor, notes, at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(request.id)
            .bind(seq as i32)
            .bind(withdrawal_status_str(entry.status))
            .bind(&entry.actor)
            .bind(&entry.notes)
            .bind(entry.at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn locked_balance(
        tx: &mut Transaction<'_, Postgres>,
        vendor_id: Uuid,
    ) -> EngineResult<i64> {
        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT balance FROM wallets WHERE vendor_id = $1 FOR UPDATE")
                .bind(vendor_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_err)?;
        Ok(balance.map(|(b,)| b).unwrap_or(0))
    }

    /// Sum of the vendor's other Approved or Processing requests: each holds
    /// a claim on the balance until it completes or fails.
    async fn outstanding_claims(
        tx: &mut Transaction<'_, Postgres>,
        vendor_id: Uuid,
        excluding: Uuid,
    ) -> EngineResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(requested_amount), 0)::bigint FROM withdrawal_requests
             WHERE vendor_id = $1 AND id <> $2 AND status IN ('APPROVED', 'PROCESSING')",
        )
        .bind(vendor_id)
        .bind(excluding)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(sum)
    }
}

#[async_trait]
impl WalletRepository for PgWalletRepository {
    async fn ensure_wallet(&self, vendor_id: Uuid) -> EngineResult<Wallet> {
        sqlx::query("INSERT INTO wallets (vendor_id) VALUES ($1) ON CONFLICT (vendor_id) DO NOTHING")
            .bind(vendor_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT vendor_id, balance, pending, total_earned, currency, updated_at
             FROM wallets WHERE vendor_id = $1",
        )
        .bind(vendor_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into_wallet())
    }

    async fn wallet(&self, vendor_id: Uuid) -> EngineResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT vendor_id, balance, pending, total_earned, currency, updated_at
             FROM wallets WHERE vendor_id = $1",
        )
        .bind(vendor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(WalletRow::into_wallet))
    }

    async fn transactions(
        &self,
        vendor_id: Uuid,
        filter: &TxFilter,
    ) -> EngineResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as::<_, TxRow>(
            "SELECT id, vendor_id, tx_type, amount, source, related_id, related_type,
                    description, created_at
             FROM wallet_transactions
             WHERE vendor_id = $1
               AND ($2::text IS NULL OR tx_type = $2)
               AND ($3::text IS NULL OR source = $3)
             ORDER BY created_at DESC
             LIMIT $4",
        )
        .bind(vendor_id)
        .bind(filter.tx_type.map(tx_type_str))
        .bind(filter.source.map(tx_source_str))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(TxRow::into_transaction).collect()
    }

    async fn create_withdrawal(&self, request: &WithdrawalRequest) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO withdrawal_requests (id, vendor_id, requested_amount, processing_fee,
                    net_amount, bank_name, account_name, account_number, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(request.id)
        .bind(request.vendor_id)
        .bind(request.requested_amount)
        .bind(request.processing_fee)
        .bind(request.net_amount)
        .bind(&request.bank_account.bank_name)
        .bind(&request.bank_account.account_name)
        .bind(&request.bank_account.account_number)
        .bind(withdrawal_status_str(request.status))
        .bind(request.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::append_events(&mut tx, request, 0).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn withdrawal(&self, id: Uuid) -> EngineResult<Option<WithdrawalRequest>> {
        let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let events = self.events_for_pool(row.id).await?;
                Ok(Some(request_from_parts(row, events)?))
            }
            None => Ok(None),
        }
    }

    async fn list_withdrawals(
        &self,
        filter: &WithdrawalFilter,
    ) -> EngineResult<Vec<WithdrawalRequest>> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests
             WHERE ($1::uuid IS NULL OR vendor_id = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at ASC"
        ))
        .bind(filter.vendor_id)
        .bind(filter.status.map(withdrawal_status_str))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let events = self.events_for_pool(row.id).await?;
            requests.push(request_from_parts(row, events)?);
        }
        Ok(requests)
    }

    async fn transition_withdrawal(
        &self,
        id: Uuid,
        next: WithdrawalStatus,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut request = Self::lock_request(&mut tx, id).await?;
        let prior = request.status_history.len();

        if !request.status.may_become(next) {
            return Err(EngineError::Conflict(format!(
                "withdrawal {id} cannot move {:?} -> {:?}",
                request.status, next
            )));
        }

        let now = Utc::now();
        match next {
            WithdrawalStatus::Approved => {
                // Approval-time re-check under the wallet row lock: the
                // balance may have moved since the request was filed, and
                // earlier approvals claim their share until completion.
                let balance = Self::locked_balance(&mut tx, request.vendor_id).await?;
                let outstanding =
                    Self::outstanding_claims(&mut tx, request.vendor_id, id).await?;
                let available = balance - outstanding;
                if request.requested_amount > available {
                    return Err(EngineError::InsufficientFunds {
                        requested: request.requested_amount,
                        available,
                    });
                }
                let review = request.review.get_or_insert_with(|| Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: now,
                    notes: None,
                    rejection_reason: None,
                });
                review.reviewed_by = actor.to_string();
                review.reviewed_at = now;
                review.notes = notes.clone();
            }
            WithdrawalStatus::UnderReview => {
                request.review = Some(Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: now,
                    notes: None,
                    rejection_reason: None,
                });
            }
            WithdrawalStatus::Rejected => {
                let review = request.review.get_or_insert_with(|| Review {
                    reviewed_by: actor.to_string(),
                    reviewed_at: now,
                    notes: None,
                    rejection_reason: None,
                });
                review.rejection_reason = notes.clone();
            }
            WithdrawalStatus::Processing => {
                request.processing = Some(Processing {
                    processed_by: actor.to_string(),
                    processed_at: now,
                    transaction_reference: None,
                });
            }
            _ => {}
        }

        request.append_status(next, actor, notes);
        Self::store_request(&mut tx, &request).await?;
        Self::append_events(&mut tx, &request, prior).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(request)
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        actor: &str,
        transaction_reference: &str,
    ) -> EngineResult<WalletTransaction> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut request = Self::lock_request(&mut tx, id).await?;
        let prior = request.status_history.len();

        // Only a Processing request may complete; a concurrent duplicate
        // call loses on the row lock and fails here.
        if request.status != WithdrawalStatus::Processing {
            return Err(EngineError::Conflict(format!(
                "withdrawal {id} cannot complete from {:?}",
                request.status
            )));
        }

        let debit = WalletTransaction::debit(
            request.vendor_id,
            request.requested_amount,
            TxSource::WithdrawalPayout,
            Some(id),
            Some("withdrawal_request".to_string()),
            format!("payout {transaction_reference}"),
        );

        sqlx::query(
            "UPDATE wallets SET balance = balance - $2, updated_at = NOW() WHERE vendor_id = $1",
        )
        .bind(request.vendor_id)
        .bind(request.requested_amount)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO wallet_transactions (id, vendor_id, tx_type, amount, source,
                    related_id, related_type, description, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(debit.id)
        .bind(debit.vendor_id)
        .bind(tx_type_str(debit.tx_type))
        .bind(debit.amount)
        .bind(tx_source_str(debit.source))
        .bind(debit.related_id)
        .bind(&debit.related_type)
        .bind(&debit.description)
        .bind(debit.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(processing) = request.processing.as_mut() {
            processing.transaction_reference = Some(transaction_reference.to_string());
        }
        request.append_status(
            WithdrawalStatus::Completed,
            actor,
            Some(format!("payout reference {transaction_reference}")),
        );
        Self::store_request(&mut tx, &request).await?;
        Self::append_events(&mut tx, &request, prior).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(debit)
    }
}
