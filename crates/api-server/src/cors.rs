//! CORS for the control surface
//!
//! This API grants and revokes network access, so cross-origin calls
//! are off unless the deployment explicitly lists its operator-console
//! origins. An empty list means a same-origin deployment (the console
//! served from or reverse-proxied through this host) and emits no CORS
//! grants at all; a wildcard origin is refused outright.

use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::info;

/// Build the CORS layer from the configured origin list
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|origin| origin.contains('*')) {
        panic!("api.allowed_origins cannot contain a wildcard (*)");
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            let origin = origin.trim();
            if origin.is_empty() {
                return None;
            }
            origin.parse::<HeaderValue>().ok()
        })
        .collect();

    if origins.is_empty() {
        info!("no CORS origins configured; control API is same-origin only");
        return CorsLayer::new();
    }

    info!(origins = origins.len(), "configuring CORS allowed origins");

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ])
        .max_age(std::time::Duration::from_secs(3600))
}
