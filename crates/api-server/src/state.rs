//! Shared application state and API configuration

use crate::rate_limit::RateLimiter;
use access_engine::ControlApi;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// HTTP surface configuration; lives beside the engine sections in the
/// same JSON document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Bearer token required on write operations; unset means an open
    /// development deployment
    pub operator_token: Option<String>,
    /// Operator-console origins allowed cross-origin access. Empty
    /// means same-origin only; wildcards are refused at startup.
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9090".to_string(),
            operator_token: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl ApiConfig {
    /// Extract the `api` section from a combined configuration document
    pub fn from_json_str(data: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Combined {
            api: ApiConfig,
        }
        let combined: Combined = serde_json::from_str(data)?;
        Ok(combined.api)
    }
}

/// State shared by every handler
pub struct AppState {
    pub control: Arc<ControlApi>,
    pub operator_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(control: Arc<ControlApi>, config: &ApiConfig) -> Self {
        let rate = &control.config().rate_limit;
        let limiter = Arc::new(RateLimiter::new(rate.requests_per_minute, rate.burst));
        Self {
            control,
            operator_token: config.operator_token.clone(),
            allowed_origins: config.allowed_origins.clone(),
            limiter,
        }
    }
}
