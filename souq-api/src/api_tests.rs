use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use souq_core::catalog::ProductSnapshot;
use souq_core::money::{commission, FeePolicy};
use souq_order::repository::{OrderRepository, SettlementRepository};
use souq_order::{AdjudicationService, CheckoutService, MemoryEngine, SettlementService};
use souq_wallet::repository::WalletRepository;
use souq_wallet::service::WalletService;

use crate::app;
use crate::middleware::auth::Claims;
use crate::state::{AppState, AuthConfig};

const SECRET: &str = "test-secret";

fn token(sub: &str, role: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3_600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// App backed by the in-memory engine, seeded with one vendor and one
/// 6,000-unit product.
async fn test_app() -> (Router, Arc<MemoryEngine>, Uuid, Uuid) {
    let engine = Arc::new(MemoryEngine::new());
    let vendor_id = Uuid::new_v4();
    let product_id = Uuid::new_v4();
    engine
        .seed_product(ProductSnapshot {
            product_id,
            vendor_id,
            name: "Brass Lamp".into(),
            unit_price: 6_000,
            size: None,
        })
        .await;

    let orders: Arc<dyn OrderRepository> = engine.clone();
    let settlement_repo: Arc<dyn SettlementRepository> = engine.clone();
    let wallet_repo: Arc<dyn WalletRepository> = engine.clone();

    let checkout = Arc::new(CheckoutService::new(engine.clone(), orders.clone()));
    let settlement = Arc::new(SettlementService::new(
        orders.clone(),
        settlement_repo.clone(),
    ));
    let adjudication = Arc::new(AdjudicationService::new(
        orders.clone(),
        settlement_repo,
        settlement.clone(),
    ));
    let wallets = Arc::new(WalletService::new(wallet_repo, FeePolicy::default()));

    let state = AppState {
        orders,
        checkout,
        settlement,
        adjudication,
        wallets,
        auth: AuthConfig {
            secret: SECRET.to_string(),
            expiration: 3_600,
        },
        return_window_days: 7,
    };
    (app(state), engine, vendor_id, product_id)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    let request = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn order_body(key: &str, product_id: Uuid, vendor_id: Uuid) -> Value {
    json!({
        "idempotency_key": key,
        "shipping_address": "12 Market Lane",
        "lines": [{ "product_id": product_id, "quantity": 1 }],
        "shipping": [{ "vendor_id": vendor_id, "method": "standard", "fee": 0 }]
    })
}

/// Create an order as the customer and return (order json, sub-order id).
async fn place_order(
    app: &Router,
    customer: &str,
    key: &str,
    product_id: Uuid,
    vendor_id: Uuid,
) -> (Value, Uuid) {
    let (status, order) = send(
        app,
        Method::POST,
        "/v1/orders",
        Some(&token(customer, "CUSTOMER")),
        Some(order_body(key, product_id, vendor_id)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let sub_id: Uuid = order["sub_orders"][0]["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    (order, sub_id)
}

async fn pay(app: &Router, key: &str, amount: i64) -> (StatusCode, Value) {
    send(
        app,
        Method::POST,
        "/v1/webhooks/payments",
        None,
        Some(json!({
            "idempotency_key": key,
            "gateway_reference": "gw-1",
            "amount_paid": amount
        })),
    )
    .await
}

async fn deliver(app: &Router, sub_id: Uuid, vendor_id: Uuid) {
    let vendor = token(&vendor_id.to_string(), "VENDOR");
    for status in ["PROCESSING", "SHIPPED", "OUT_FOR_DELIVERY", "DELIVERED"] {
        let (code, _) = send(
            app,
            Method::POST,
            &format!("/v1/sub-orders/{sub_id}/status"),
            Some(&vendor),
            Some(json!({ "status": status })),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_webhook_is_idempotent() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, _) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    let total = order["total_amount"].as_i64().unwrap();

    let (status, body) = pay(&app, "key-1", total).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ORDER_CONFIRMED");

    // At-least-once delivery: the retry is acknowledged, not re-applied.
    let (status, body) = pay(&app, "key-1", total).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ALREADY_CONFIRMED");
}

#[tokio::test]
async fn test_webhook_amount_mismatch_is_bad_gateway() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, _) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    let total = order["total_amount"].as_i64().unwrap();

    let (status, _) = pay(&app, "key-1", total - 1).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // The order is still pending and payable.
    let (status, body) = pay(&app, "key-1", total).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ORDER_CONFIRMED");
}

#[tokio::test]
async fn test_duplicate_checkout_key_is_conflict() {
    let (app, _, vendor_id, product_id) = test_app().await;
    place_order(&app, "cust-1", "key-dup", product_id, vendor_id).await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/orders",
        Some(&token("cust-1", "CUSTOMER")),
        Some(order_body("key-dup", product_id, vendor_id)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_auth_boundaries() {
    let (app, _, _, _) = test_app().await;

    // No token.
    let (status, _) = send(&app, Method::GET, "/v1/admin/escrow/queue", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Wrong role on an admin route.
    let vendor = token(&Uuid::new_v4().to_string(), "VENDOR");
    let (status, _) = send(
        &app,
        Method::GET,
        "/v1/admin/escrow/queue",
        Some(&vendor),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Vendor tokens cannot place orders.
    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/orders",
        Some(&vendor),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cross_customer_access_is_forbidden() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, _) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    let order_id = order["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/v1/orders/{order_id}"),
        Some(&token("cust-2", "CUSTOMER")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_other_vendor_cannot_transition_sub_order() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, sub_id) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    pay(&app, "key-1", order["total_amount"].as_i64().unwrap()).await;

    let intruder = token(&Uuid::new_v4().to_string(), "VENDOR");
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/sub-orders/{sub_id}/status"),
        Some(&intruder),
        Some(json!({ "status": "PROCESSING" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_full_settlement_flow() {
    let (app, engine, vendor_id, product_id) = test_app().await;
    let (order, sub_id) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    pay(&app, "key-1", order["total_amount"].as_i64().unwrap()).await;
    deliver(&app, sub_id, vendor_id).await;

    // Customer confirms receipt.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/sub-orders/{sub_id}/confirm"),
        Some(&token("cust-1", "CUSTOMER")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The sub-order is now in the admin's release queue.
    let admin = token("ops-1", "ADMIN");
    let (status, queue) = send(&app, Method::GET, "/v1/admin/escrow/queue", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue.as_array().unwrap().len(), 1);

    let (status, receipt) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/escrow/{sub_id}/release"),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let expected = commission(6_000);
    assert_eq!(
        receipt["breakdown"]["settle_amount"].as_i64().unwrap(),
        expected.settle_amount
    );

    // Vendor sees the credited wallet.
    let vendor = token(&vendor_id.to_string(), "VENDOR");
    let (status, wallet) = send(&app, Method::GET, "/v1/vendor/wallet", Some(&vendor), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wallet["balance"].as_i64().unwrap(), expected.settle_amount);
    assert_eq!(
        engine.wallets().reconciled_balance(vendor_id).await,
        expected.settle_amount
    );

    // Releasing twice is a conflict.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/escrow/{sub_id}/release"),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_withdrawal_workflow() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, sub_id) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    pay(&app, "key-1", order["total_amount"].as_i64().unwrap()).await;
    deliver(&app, sub_id, vendor_id).await;
    send(
        &app,
        Method::POST,
        &format!("/v1/sub-orders/{sub_id}/confirm"),
        Some(&token("cust-1", "CUSTOMER")),
        None,
    )
    .await;

    let admin = token("ops-1", "ADMIN");
    send(
        &app,
        Method::POST,
        &format!("/v1/admin/escrow/{sub_id}/release"),
        Some(&admin),
        None,
    )
    .await;
    let balance = commission(6_000).settle_amount;

    let vendor = token(&vendor_id.to_string(), "VENDOR");
    let bank = json!({
        "bank_name": "First Bank",
        "account_name": "Brass Goods",
        "account_number": "0001112223"
    });

    // Over the balance: rejected up front.
    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/vendor/withdrawals",
        Some(&vendor),
        Some(json!({ "amount": balance + 1, "bank_account": bank })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, request) = send(
        &app,
        Method::POST,
        "/v1/vendor/withdrawals",
        Some(&vendor),
        Some(json!({ "amount": 5_000, "bank_account": bank })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = request["id"].as_str().unwrap().to_string();

    for step in ["review", "approve", "process"] {
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/v1/admin/withdrawals/{id}/{step}"),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "step {step}");
    }

    let (status, debit) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/withdrawals/{id}/complete"),
        Some(&admin),
        Some(json!({ "transaction_reference": "payout-77" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(debit["amount"].as_i64().unwrap(), 5_000);

    let (_, wallet) = send(&app, Method::GET, "/v1/vendor/wallet", Some(&vendor), None).await;
    assert_eq!(wallet["balance"].as_i64().unwrap(), balance - 5_000);

    // A second completion must not double-debit.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/withdrawals/{id}/complete"),
        Some(&admin),
        Some(json!({ "transaction_reference": "payout-77" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_dispute_goes_through_adjudication() {
    let (app, _, vendor_id, product_id) = test_app().await;
    let (order, sub_id) = place_order(&app, "cust-1", "key-1", product_id, vendor_id).await;
    pay(&app, "key-1", order["total_amount"].as_i64().unwrap()).await;

    // Vendor cancels before shipping.
    let vendor = token(&vendor_id.to_string(), "VENDOR");
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/sub-orders/{sub_id}/status"),
        Some(&vendor),
        Some(json!({ "status": "CANCELED", "notes": "out of stock" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let admin = token("ops-1", "ADMIN");
    let (_, queue) = send(
        &app,
        Method::GET,
        "/v1/admin/adjudication/queue",
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(queue.as_array().unwrap().len(), 1);

    // Direct release of a disputed sub-order is refused.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/escrow/{sub_id}/release"),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, resolved) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/adjudication/{sub_id}/resolve"),
        Some(&admin),
        Some(json!({ "decision": "APPROVE_REFUND", "reason": "vendor out of stock" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["escrow"]["refunded"], Value::Bool(true));

    // Resolving twice is a conflict.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/admin/adjudication/{sub_id}/resolve"),
        Some(&admin),
        Some(json!({ "decision": "APPROVE_REFUND", "reason": "again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
