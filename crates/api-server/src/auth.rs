//! Operator authentication
//!
//! Write operations require the operator bearer token from the API
//! configuration. Credential storage, admin login, and token issuance
//! belong to the portal facade; this layer only checks the capability.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

/// Constant-time byte comparison so token checks don't leak prefixes
/// through timing
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extractor gating write handlers on the operator capability
pub struct Operator;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.operator_token else {
            // Unset token means an open development deployment; the
            // startup log carries the warning.
            return Ok(Operator);
        };

        let provided = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(token) if tokens_match(token, expected) => Ok(Operator),
            Some(_) => Err(ApiError::unauthorized("invalid operator token")),
            None => Err(ApiError::unauthorized("operator token required")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secres"));
        assert!(!tokens_match("secret", "secret2"));
        assert!(!tokens_match("", "secret"));
    }
}
