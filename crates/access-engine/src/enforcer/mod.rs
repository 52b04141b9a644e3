//! Enforcer capability
//!
//! The single seam between the engine and the packet-filter plane. Two
//! implementations exist: a shell backend that drives iptables/ebtables
//! on the host, and an in-memory simulator. The choice is made once at
//! process construction; callers never branch on which one they hold.
//!
//! Failure is in-band: `apply` and `retract` return outcome values, not
//! `Err`, so partial installation is always observable and retract stays
//! idempotent.

use crate::mac::MacAddr;
use crate::rules::{RuleBackend, RuleKind, RuleSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod shell;
pub mod simulator;

pub use shell::ShellEnforcer;
pub use simulator::SimulatedEnforcer;

/// Opaque, self-describing reference to one installed rule. Handles are
/// serializable so the ledger can drive retraction after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleHandle {
    pub id: String,
    pub backend: RuleBackend,
    /// Canonical rule text; enough for the owning backend to rebuild a
    /// delete command without any other state
    pub spec: String,
}

/// Result of one apply call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    Ok,
    /// Some rules installed; returned handles cover exactly those
    Partial,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub handles: Vec<RuleHandle>,
    pub result: ApplyResult,
    pub diagnostics: Vec<String>,
    /// Backend rejected the rule outright (retry cannot help)
    pub permanent: bool,
}

impl ApplyOutcome {
    pub fn ok(handles: Vec<RuleHandle>) -> Self {
        Self {
            handles,
            result: ApplyResult::Ok,
            diagnostics: Vec::new(),
            permanent: false,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            handles: Vec::new(),
            result: ApplyResult::Failed,
            diagnostics: vec![diagnostic.into()],
            permanent: false,
        }
    }
}

/// Result of one retract call. Missing handles are not an error.
#[derive(Debug, Clone, Default)]
pub struct RetractOutcome {
    pub retracted: Vec<RuleHandle>,
    pub still_present: Vec<RuleHandle>,
    pub missing: Vec<RuleHandle>,
}

/// One rule as the backend believes it to be installed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRule {
    pub handle: RuleHandle,
    pub kind: RuleKind,
    pub mac: MacAddr,
    pub installed_at: DateTime<Utc>,
}

/// Capability for installing and removing packet-filter rules
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Install one rule set. On PARTIAL the returned handles cover the
    /// rules that actually landed; the caller owns their retraction.
    async fn apply(&self, rules: &RuleSet) -> ApplyOutcome;

    /// Remove previously installed rules. Idempotent: unknown handles
    /// come back in `missing`.
    async fn retract(&self, handles: &[RuleHandle]) -> RetractOutcome;

    /// Rules currently installed, consistent within one call. Used only
    /// by reconciliation.
    async fn snapshot(&self) -> Vec<InstalledRule>;
}
