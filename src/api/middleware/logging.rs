//! Request logging middleware

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info};

/// Request logging middleware
pub struct RequestLogging;

impl RequestLogging {
    /// Log each control request with its raw query
    pub async fn log_request(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let start = Instant::now();

        debug!(%method, %path, %query, "Control request started");

        let response = next.run(req).await;

        info!(
            %method,
            %path,
            %query,
            status = response.status().as_u16(),
            elapsed = ?start.elapsed(),
            "Control request"
        );

        response
    }
}
