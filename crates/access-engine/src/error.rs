//! Engine error taxonomy
//!
//! Every fallible control operation returns one of these variants. The
//! HTTP layer maps them onto a structured `{ category, detail }` payload;
//! no internal error crosses the control boundary as a panic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access-control engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session already terminated: {0}")]
    AlreadyTerminated(String),

    #[error("rule backend transient failure: {0}")]
    EnforcerTransient(String),

    #[error("rule backend permanent reject: {0}")]
    EnforcerPermanent(String),

    #[error("ledger and rule backend diverged: {0}")]
    Inconsistent(String),
}

/// Stable failure category carried across the control boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    InvalidInput,
    PolicyDenied,
    Conflict,
    NotFound,
    AlreadyTerminated,
    EnforcerFailed,
    Inconsistent,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::InvalidInput(_) => ErrorCategory::InvalidInput,
            EngineError::PolicyDenied(_) => ErrorCategory::PolicyDenied,
            EngineError::NotFound(_) => ErrorCategory::NotFound,
            EngineError::AlreadyTerminated(_) => ErrorCategory::AlreadyTerminated,
            EngineError::EnforcerTransient(_) | EngineError::EnforcerPermanent(_) => {
                ErrorCategory::EnforcerFailed
            }
            EngineError::Inconsistent(_) => ErrorCategory::Inconsistent,
        }
    }

    /// Structured report for the control boundary
    pub fn report(&self, session_id: Option<String>) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            detail: self.to_string(),
            session_id,
        }
    }
}

/// Failure payload returned by every control operation that fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            EngineError::InvalidInput("bad mac".into()).category(),
            ErrorCategory::InvalidInput
        );
        assert_eq!(
            EngineError::EnforcerTransient("timeout".into()).category(),
            ErrorCategory::EnforcerFailed
        );
        assert_eq!(
            EngineError::EnforcerPermanent("reject".into()).category(),
            ErrorCategory::EnforcerFailed
        );
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::EnforcerFailed).unwrap();
        assert_eq!(json, "\"ENFORCER_FAILED\"");

        let json = serde_json::to_string(&ErrorCategory::PolicyDenied).unwrap();
        assert_eq!(json, "\"POLICY_DENIED\"");
    }

    #[test]
    fn test_report_carries_session() {
        let report = EngineError::NotFound("s-1".into()).report(Some("s-1".into()));
        assert_eq!(report.category, ErrorCategory::NotFound);
        assert_eq!(report.session_id.as_deref(), Some("s-1"));
    }
}
