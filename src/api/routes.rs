//! API route definitions

use axum::routing::{any, get};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the control-plane router
pub fn create_router(state: AppState) -> Router {
    // Control endpoints answer whatever the method
    Router::new()
        .route("/changeip", any(handlers::control::change_ip))
        .route("/getmobilenumber", any(handlers::control::mobile_number))
        .route("/screenon", any(handlers::control::screen_on))
        .route("/proxylist", any(handlers::control::proxy_list))
        .route("/nighttransfer", any(handlers::control::night_transfer))
        // Operator endpoints
        .route("/health", get(handlers::health::health_check))
        .route("/status", get(handlers::health::status))
        .fallback(handlers::control::wrong_url)
        .with_state(state)
}
