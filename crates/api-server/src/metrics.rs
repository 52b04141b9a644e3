//! Prometheus metrics middleware and exporter

use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};
use tracing::error;

lazy_static! {
    /// HTTP request counter
    static ref HTTP_REQUEST_COUNTER: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total HTTP requests",
        &["method", "status"]
    )
    .unwrap();

    /// Granted sessions
    pub static ref GRANTS_TOTAL: IntCounter =
        register_int_counter!("access_grants_total", "Total granted sessions").unwrap();

    /// Revoked sessions (all reasons)
    pub static ref REVOKES_TOTAL: IntCounter =
        register_int_counter!("access_revokes_total", "Total revoked sessions").unwrap();

    /// Grants that failed at the rule backend
    pub static ref GRANT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "access_grant_failures_total",
        "Grants rejected or failed at the rule backend"
    )
    .unwrap();
}

/// Count every request by method and response status
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();

    HTTP_REQUEST_COUNTER
        .with_label_values(&[&method, &status])
        .inc();

    response
}

/// `/metrics` exporter
pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
