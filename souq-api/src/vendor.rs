use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use souq_core::identity::Caller;
use souq_wallet::models::{
    BankAccountSnapshot, TxFilter, Wallet, WalletTransaction, WithdrawalFilter,
    WithdrawalRequest,
};

use crate::error::AppError;
use crate::middleware::auth::Claims;
use crate::state::AppState;

fn vendor_id(claims: &Claims) -> Result<Uuid, AppError> {
    Uuid::parse_str(&claims.sub).map_err(|_| {
        AppError::AuthorizationError("vendor identity is not a valid id".to_string())
    })
}

/// GET /v1/vendor/wallet
pub async fn get_wallet(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Wallet>, AppError> {
    let wallet = state.wallets.wallet(vendor_id(&claims)?).await?;
    Ok(Json(wallet))
}

/// GET /v1/vendor/wallet/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(filter): Query<TxFilter>,
) -> Result<Json<Vec<WalletTransaction>>, AppError> {
    let rows = state
        .wallets
        .transactions(vendor_id(&claims)?, &filter)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateWithdrawalRequest {
    pub amount: i64,
    pub bank_account: BankAccountSnapshot,
}

/// POST /v1/vendor/withdrawals
pub async fn create_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateWithdrawalRequest>,
) -> Result<(StatusCode, Json<WithdrawalRequest>), AppError> {
    let vendor_id = vendor_id(&claims)?;
    let caller = Caller::vendor(claims.sub);
    let request = state
        .wallets
        .create_withdrawal(&caller, vendor_id, payload.amount, payload.bank_account)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /v1/vendor/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<WithdrawalRequest>>, AppError> {
    let rows = state
        .wallets
        .list_withdrawals(&WithdrawalFilter {
            vendor_id: Some(vendor_id(&claims)?),
            status: None,
        })
        .await?;
    Ok(Json(rows))
}
