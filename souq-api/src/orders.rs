use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use souq_core::identity::Caller;
use souq_order::checkout::{CartLine, CheckoutRequest, VendorShipping};
use souq_order::models::{DeliveryStatus, Order, SubOrder};

use crate::error::AppError;
use crate::middleware::auth::Claims;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub idempotency_key: String,
    pub shipping_address: String,
    pub lines: Vec<CartLine>,
    pub shipping: Vec<VendorShipping>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DeliveryStatus,
    pub notes: Option<String>,
}

// ============================================================================
// Customer Handlers
// ============================================================================

/// POST /v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state
        .checkout
        .create_order(CheckoutRequest {
            customer_id: claims.sub,
            idempotency_key: payload.idempotency_key,
            shipping_address: payload.shipping_address,
            lines: payload.lines,
            shipping: payload.shipping,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /v1/orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .order(id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("order {id}")))?;

    if order.customer_id != claims.sub {
        return Err(AppError::AuthorizationError(
            "order belongs to another customer".to_string(),
        ));
    }
    Ok(Json(order))
}

/// POST /v1/sub-orders/{id}/confirm
///
/// Customer confirms receipt of a delivered sub-order; idempotent.
pub async fn confirm_delivery(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubOrder>, AppError> {
    let sub = state
        .orders
        .sub_order(id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("sub-order {id}")))?;
    let order = state
        .orders
        .order(sub.order_id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("order {}", sub.order_id)))?;
    if order.customer_id != claims.sub {
        return Err(AppError::AuthorizationError(
            "sub-order belongs to another customer".to_string(),
        ));
    }

    let confirmed = state.orders.confirm_delivery(id, Utc::now()).await?;
    Ok(Json(confirmed))
}

// ============================================================================
// Vendor Handlers
// ============================================================================

/// POST /v1/sub-orders/{id}/status
pub async fn update_delivery_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<SubOrder>, AppError> {
    let vendor_id = Uuid::parse_str(&claims.sub).map_err(|_| {
        AppError::AuthorizationError("vendor identity is not a valid id".to_string())
    })?;

    let sub = state
        .orders
        .sub_order(id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("sub-order {id}")))?;
    if sub.vendor_id != vendor_id {
        return Err(AppError::AuthorizationError(
            "sub-order belongs to another vendor".to_string(),
        ));
    }

    let caller = Caller::vendor(claims.sub);
    let updated = state
        .orders
        .apply_transition(
            id,
            payload.status,
            &caller.audit_tag(),
            payload.notes,
            state.return_window_days,
        )
        .await?;
    Ok(Json(updated))
}
