//! In-memory rule backend
//!
//! Records intent without touching the host. Apart from scripted faults
//! every operation succeeds, which makes this the deployment backend for
//! SIMULATION mode and the test double for everything above it.

use crate::enforcer::{
    ApplyOutcome, ApplyResult, Enforcer, InstalledRule, RetractOutcome, RuleHandle,
};
use crate::rules::{RuleKind, RuleSet};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A one-shot scripted failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Next apply of this kind fails with nothing installed
    Apply(RuleKind),
    /// Next retract reports its handles still present
    Retract,
}

/// Simulated enforcer with scripted faults and operation counters
pub struct SimulatedEnforcer {
    installed: Mutex<Vec<InstalledRule>>,
    faults: Mutex<Vec<Fault>>,
    apply_calls: AtomicU64,
    retract_calls: AtomicU64,
}

impl SimulatedEnforcer {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            apply_calls: AtomicU64::new(0),
            retract_calls: AtomicU64::new(0),
        }
    }

    /// Script the next apply of `kind` to fail once
    pub async fn fault_next_apply(&self, kind: RuleKind) {
        self.faults.lock().await.push(Fault::Apply(kind));
    }

    /// Script the next retract to report its handles still present
    pub async fn fault_next_retract(&self) {
        self.faults.lock().await.push(Fault::Retract);
    }

    /// Mutating calls made so far (apply + retract); snapshots excluded
    pub fn mutation_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::Relaxed) + self.retract_calls.load(Ordering::Relaxed)
    }

    pub async fn installed_count(&self) -> usize {
        self.installed.lock().await.len()
    }

    async fn take_fault(&self, want: Fault) -> bool {
        let mut faults = self.faults.lock().await;
        if let Some(pos) = faults.iter().position(|f| *f == want) {
            faults.remove(pos);
            true
        } else {
            false
        }
    }
}

impl Default for SimulatedEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Enforcer for SimulatedEnforcer {
    async fn apply(&self, rules: &RuleSet) -> ApplyOutcome {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);

        if self.take_fault(Fault::Apply(rules.kind)).await {
            return ApplyOutcome::failed(format!(
                "injected fault: apply {} rejected",
                rules.kind.as_str()
            ));
        }

        let now = Utc::now();
        let mut installed = self.installed.lock().await;
        let mut handles = Vec::new();

        for rendered in rules.render() {
            let handle = RuleHandle {
                id: Uuid::new_v4().to_string(),
                backend: rendered.backend,
                spec: rendered.text(),
            };
            handles.push(handle.clone());

            let rule = InstalledRule {
                handle,
                kind: rules.kind,
                mac: rules.mac,
                installed_at: now,
            };
            // Keep the simulated chain in match order so snapshots show
            // guards ahead of egress regardless of application order.
            let pos = installed
                .iter()
                .position(|r| {
                    r.mac == rule.mac
                        && r.kind.match_priority() > rule.kind.match_priority()
                })
                .unwrap_or(installed.len());
            installed.insert(pos, rule);
        }

        ApplyOutcome::ok(handles)
    }

    async fn retract(&self, handles: &[RuleHandle]) -> RetractOutcome {
        self.retract_calls.fetch_add(1, Ordering::Relaxed);

        if self.take_fault(Fault::Retract).await {
            return RetractOutcome {
                retracted: Vec::new(),
                still_present: handles.to_vec(),
                missing: Vec::new(),
            };
        }

        let mut installed = self.installed.lock().await;
        let mut outcome = RetractOutcome::default();

        for handle in handles {
            if let Some(pos) = installed.iter().position(|r| r.handle.id == handle.id) {
                installed.remove(pos);
                outcome.retracted.push(handle.clone());
            } else {
                outcome.missing.push(handle.clone());
            }
        }

        outcome
    }

    async fn snapshot(&self) -> Vec<InstalledRule> {
        self.installed.lock().await.clone()
    }
}
