use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use souq_core::identity::Caller;
use souq_order::repository::{ReleaseFilter, ReleaseReceipt};
use souq_order::{AdjudicationDecision, SubOrder};
use souq_wallet::models::{WalletTransaction, WithdrawalFilter, WithdrawalRequest};

use crate::error::AppError;
use crate::middleware::auth::Claims;
use crate::state::AppState;

// ============================================================================
// Escrow
// ============================================================================

/// GET /v1/admin/escrow/queue
pub async fn escrow_queue(
    State(state): State<AppState>,
    Query(filter): Query<ReleaseFilter>,
) -> Result<Json<Vec<SubOrder>>, AppError> {
    let queue = state.settlement.release_queue(&filter).await?;
    Ok(Json(queue))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    pub notes: Option<String>,
}

/// POST /v1/admin/escrow/{id}/release
pub async fn release_escrow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ReleaseRequest>>,
) -> Result<Json<ReleaseReceipt>, AppError> {
    let caller = Caller::admin(claims.sub);
    let notes = payload.and_then(|Json(p)| p.notes);
    let receipt = state.settlement.release(id, &caller, notes).await?;
    Ok(Json(receipt))
}

// ============================================================================
// Adjudication
// ============================================================================

/// GET /v1/admin/adjudication/queue
pub async fn adjudication_queue(
    State(state): State<AppState>,
) -> Result<Json<Vec<SubOrder>>, AppError> {
    let queue = state.adjudication.queue().await?;
    Ok(Json(queue))
}

/// POST /v1/admin/adjudication/{id}/resolve
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(decision): Json<AdjudicationDecision>,
) -> Result<Json<SubOrder>, AppError> {
    let caller = Caller::admin(claims.sub);
    let resolved = state.adjudication.resolve(id, decision, &caller).await?;
    Ok(Json(resolved))
}

// ============================================================================
// Withdrawals
// ============================================================================

/// GET /v1/admin/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    Query(filter): Query<WithdrawalFilter>,
) -> Result<Json<Vec<WithdrawalRequest>>, AppError> {
    let rows = state.wallets.list_withdrawals(&filter).await?;
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReviewNotes {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub transaction_reference: String,
}

/// POST /v1/admin/withdrawals/{id}/review
pub async fn review_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<WithdrawalRequest>, AppError> {
    let caller = Caller::admin(claims.sub);
    Ok(Json(state.wallets.begin_review(&caller, id).await?))
}

/// POST /v1/admin/withdrawals/{id}/approve
pub async fn approve_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ReviewNotes>>,
) -> Result<Json<WithdrawalRequest>, AppError> {
    let caller = Caller::admin(claims.sub);
    let notes = payload.and_then(|Json(p)| p.notes);
    Ok(Json(state.wallets.approve(&caller, id, notes).await?))
}

/// POST /v1/admin/withdrawals/{id}/reject
pub async fn reject_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> Result<Json<WithdrawalRequest>, AppError> {
    let caller = Caller::admin(claims.sub);
    Ok(Json(state.wallets.reject(&caller, id, payload.reason).await?))
}

/// POST /v1/admin/withdrawals/{id}/process
pub async fn process_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<WithdrawalRequest>, AppError> {
    let caller = Caller::admin(claims.sub);
    Ok(Json(state.wallets.start_processing(&caller, id).await?))
}

/// POST /v1/admin/withdrawals/{id}/complete
pub async fn complete_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<WalletTransaction>, AppError> {
    let caller = Caller::admin(claims.sub);
    Ok(Json(
        state
            .wallets
            .complete(&caller, id, payload.transaction_reference)
            .await?,
    ))
}

/// POST /v1/admin/withdrawals/{id}/fail
pub async fn fail_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> Result<Json<WithdrawalRequest>, AppError> {
    let caller = Caller::admin(claims.sub);
    Ok(Json(state.wallets.fail(&caller, id, payload.reason).await?))
}
