//! Request and response shapes for the control surface
//!
//! Engine outcome types serialize directly; only the inputs and a few
//! wrapper responses are defined here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeQuery {
    /// Defaults to USER_LOGOUT
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisconnectBody {
    pub operator_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub additional_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ExtendResponse {
    pub session_id: String,
    pub new_expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub mac: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub mac: String,
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct RulesQuery {
    /// `l3` or `l2`; omitted means both planes
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualBindBody {
    pub mac: String,
    pub ip: String,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UnbindResponse {
    pub mac: String,
    pub retired: usize,
}

#[derive(Debug, Deserialize)]
pub struct BlockBody {
    pub operator_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct UnblockBody {
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub mac: String,
    pub active: bool,
}
