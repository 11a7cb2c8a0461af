use axum::{
    http::Method,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod error;
pub mod middleware;
pub mod orders;
pub mod state;
pub mod vendor;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
mod api_tests;

pub use state::AppState;

use middleware::auth::{admin_auth_middleware, customer_auth_middleware, vendor_auth_middleware};

pub fn app(state: AppState) -> Router {
    // CORS Middleware
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let customer_routes = Router::new()
        .route("/v1/orders", post(orders::create_order))
        .route("/v1/orders/{id}", get(orders::get_order))
        .route("/v1/sub-orders/{id}/confirm", post(orders::confirm_delivery))
        .route_layer(from_fn_with_state(state.clone(), customer_auth_middleware));

    let vendor_routes = Router::new()
        .route("/v1/sub-orders/{id}/status", post(orders::update_delivery_status))
        .route("/v1/vendor/wallet", get(vendor::get_wallet))
        .route("/v1/vendor/wallet/transactions", get(vendor::list_transactions))
        .route(
            "/v1/vendor/withdrawals",
            post(vendor::create_withdrawal).get(vendor::list_withdrawals),
        )
        .route_layer(from_fn_with_state(state.clone(), vendor_auth_middleware));

    let admin_routes = Router::new()
        .route("/v1/admin/escrow/queue", get(admin::escrow_queue))
        .route("/v1/admin/escrow/{id}/release", post(admin::release_escrow))
        .route("/v1/admin/adjudication/queue", get(admin::adjudication_queue))
        .route("/v1/admin/adjudication/{id}/resolve", post(admin::resolve_dispute))
        .route("/v1/admin/withdrawals", get(admin::list_withdrawals))
        .route("/v1/admin/withdrawals/{id}/review", post(admin::review_withdrawal))
        .route("/v1/admin/withdrawals/{id}/approve", post(admin::approve_withdrawal))
        .route("/v1/admin/withdrawals/{id}/reject", post(admin::reject_withdrawal))
        .route("/v1/admin/withdrawals/{id}/process", post(admin::process_withdrawal))
        .route("/v1/admin/withdrawals/{id}/complete", post(admin::complete_withdrawal))
        .route("/v1/admin/withdrawals/{id}/fail", post(admin::fail_withdrawal))
        .route_layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/v1/webhooks/payments", post(webhooks::handle_payment_webhook))
        .merge(customer_routes)
        .merge(vendor_routes)
        .merge(admin_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
