//! Rule ledger rows
//!
//! The ledger is the durable record of what rules the engine intends to
//! have installed. Rows are written PENDING before the enforcer is asked
//! to install anything (write-ahead) and resolved to APPLIED or FAILED by
//! outcome recording; retraction updates rows in place. The enforcer's
//! live state is what *is* installed; reconciliation bridges the two.

use crate::enforcer::RuleHandle;
use crate::mac::MacAddr;
use crate::rules::{RuleBackend, RuleKind, RuleSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    /// Write-ahead row; the enforcer call has not been resolved yet
    Pending,
    Applied,
    Retracted,
    Failed,
    /// Retry budget exhausted; operator attention required
    Dead,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Pending => "PENDING",
            LedgerState::Applied => "APPLIED",
            LedgerState::Retracted => "RETRACTED",
            LedgerState::Failed => "FAILED",
            LedgerState::Dead => "DEAD",
        }
    }
}

/// One intended rule set for one client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    /// `None` for portal-redirect rows, which outlive any one session
    pub session_id: Option<String>,
    pub mac: MacAddr,
    pub kind: RuleKind,
    pub backend: RuleBackend,
    /// Serialized `RuleSet`, opaque to the store, replayable on retry
    pub descriptor: serde_json::Value,
    pub state: LedgerState,
    pub handles: Vec<RuleHandle>,
    pub attempts: u32,
    pub diagnostics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub retracted_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Write-ahead row for an apply that is about to happen
    pub fn write_ahead(session_id: Option<String>, rule_set: &RuleSet) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            mac: rule_set.mac,
            kind: rule_set.kind,
            backend: rule_set.backend(),
            descriptor: serde_json::to_value(rule_set).unwrap_or(serde_json::Value::Null),
            state: LedgerState::Pending,
            handles: Vec::new(),
            attempts: 0,
            diagnostics: Vec::new(),
            created_at: Utc::now(),
            retracted_at: None,
        }
    }

    /// Recover the rule set for a retry re-apply
    pub fn rule_set(&self) -> Option<RuleSet> {
        serde_json::from_value(self.descriptor.clone()).ok()
    }

    /// Rows that no longer participate in reconciliation
    pub fn is_settled(&self) -> bool {
        matches!(self.state, LedgerState::Retracted | LedgerState::Dead)
    }
}
