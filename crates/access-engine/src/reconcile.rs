//! Reconciliation and cleanup loop
//!
//! The single component allowed to retry enforcer operations on its own
//! initiative. Each cycle closes the gap between intent (the ledger) and
//! reality (the enforcer snapshot): expired sessions are revoked, stale
//! transitional sessions left by a crash are resolved, FAILED ledger
//! rows are retried with backoff until the budget promotes them to DEAD,
//! and drift in either direction is corrected. Cycles never overlap and
//! the loop exits within a bounded drain window at shutdown.

use crate::audit::{AuditCategory, AuditEvent, AuditSeverity, AuditSink};
use crate::binding::BindingRegistry;
use crate::config::ReconciliationConfig;
use crate::enforcer::{ApplyResult, Enforcer, RuleHandle};
use crate::ledger::{LedgerEntry, LedgerState};
use crate::rules::RuleKind;
use crate::session::{RevokeReason, SessionManager, SessionState};
use crate::store::MemoryStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub expired_sessions: usize,
    pub resynced_sessions: usize,
    pub retired_bindings: usize,
    pub retried_rows: usize,
    pub dead_rows: usize,
    pub orphans_retracted: usize,
    pub ghosts_repaired: usize,
    pub anomalies: usize,
}

impl CycleReport {
    fn is_quiet(&self) -> bool {
        self.expired_sessions == 0
            && self.resynced_sessions == 0
            && self.retired_bindings == 0
            && self.retried_rows == 0
            && self.dead_rows == 0
            && self.orphans_retracted == 0
            && self.ghosts_repaired == 0
            && self.anomalies == 0
    }
}

/// Periodic drift corrector
pub struct Reconciler {
    store: Arc<MemoryStore>,
    manager: Arc<SessionManager>,
    registry: Arc<BindingRegistry>,
    enforcer: Arc<dyn Enforcer>,
    sink: AuditSink,
    config: ReconciliationConfig,
    /// Two cycles never run simultaneously
    cycle_lock: Mutex<()>,
    /// Per-row not-before instants for exponential retry backoff
    backoff: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<MemoryStore>,
        manager: Arc<SessionManager>,
        registry: Arc<BindingRegistry>,
        enforcer: Arc<dyn Enforcer>,
        sink: AuditSink,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
            enforcer,
            sink,
            config,
            cycle_lock: Mutex::new(()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Run one full cycle. Also the implementation of `triggerCleanup`.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let now = Utc::now();
        let grace = Duration::seconds(self.config.grace_period_secs as i64);
        let mut report = CycleReport::default();

        // 1. Expired ACTIVE sessions
        for session in self.store.expired_active_sessions(now - grace).await {
            match self
                .manager
                .revoke_access(&session.id, RevokeReason::Expired)
                .await
            {
                Ok(_) => {
                    report.expired_sessions += 1;
                    self.sink.emit(
                        AuditEvent::new(AuditCategory::Session, AuditSeverity::Info, "expired")
                            .mac(session.mac)
                            .session(session.id.clone()),
                    );
                }
                Err(e) => debug!(session = %session.id, error = %e, "expiry revoke skipped"),
            }
        }

        // 1b. Sessions stuck between write-ahead and outcome recording
        for session in self.store.stale_transitional_sessions(now - grace).await {
            match self.manager.reconcile_stale(&session.id, now - grace).await {
                Ok(Some(_)) => {
                    report.resynced_sessions += 1;
                    info!(session = %session.id, "resolved stale transitional session");
                }
                Ok(None) => {}
                Err(e) => debug!(session = %session.id, error = %e, "stale resync skipped"),
            }
        }

        // 2. Expired bindings whose owner is gone
        for binding in self.store.expired_active_bindings(now).await {
            let owner_gone = match &binding.session_id {
                Some(sid) => match self.store.get_session(sid).await {
                    Some(session) => session.state == SessionState::Terminated,
                    None => true,
                },
                None => true,
            };
            if owner_gone {
                report.retired_bindings +=
                    self.registry.retire_by_mac(binding.mac, "expired").await;
            }
        }

        // 3. FAILED rows: bounded retry, then DEAD
        let (retried, dead) = self.retry_failed_rows(now).await;
        report.retried_rows = retried;
        report.dead_rows = dead;

        // 4. Drift between ledger and enforcer
        if self.config.drift_check {
            let (orphans, ghosts) = self.drift_check().await;
            report.orphans_retracted = orphans;
            report.ghosts_repaired = ghosts;
        }

        // 5. Anomaly sweep
        report.anomalies = self.registry.scan_anomalies().await.len();

        if report.is_quiet() {
            debug!("reconciliation cycle quiet");
        } else {
            info!(
                expired = report.expired_sessions,
                resynced = report.resynced_sessions,
                retried = report.retried_rows,
                dead = report.dead_rows,
                orphans = report.orphans_retracted,
                ghosts = report.ghosts_repaired,
                "reconciliation cycle"
            );
            self.sink.emit(
                AuditEvent::new(AuditCategory::System, AuditSeverity::Info, "reconcile_cycle")
                    .detail(serde_json::to_value(&report).unwrap_or_default()),
            );
        }

        report
    }

    async fn retry_failed_rows(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut retried = 0;
        let mut dead = 0;

        for row in self.store.ledger_in_state(LedgerState::Failed).await {
            if row.attempts >= self.config.retry_budget {
                self.store
                    .update_ledger(&row.id, |e| e.state = LedgerState::Dead)
                    .await;
                self.backoff.lock().await.remove(&row.id);
                dead += 1;
                warn!(row = %row.id, kind = row.kind.as_str(), "ledger row promoted to DEAD");
                self.sink.emit(
                    AuditEvent::new(
                        AuditCategory::System,
                        AuditSeverity::Critical,
                        "ledger_row_dead",
                    )
                    .mac(row.mac)
                    .detail(serde_json::json!({
                        "row": row.id,
                        "kind": row.kind.as_str(),
                        "diagnostics": row.diagnostics,
                    })),
                );
                continue;
            }

            // Exponential backoff between retries of the same row.
            {
                let backoff = self.backoff.lock().await;
                if let Some(not_before) = backoff.get(&row.id) {
                    if now < *not_before {
                        continue;
                    }
                }
            }

            if self.retry_row(&row).await {
                self.backoff.lock().await.remove(&row.id);
            } else {
                let delay = 2i64.saturating_pow(row.attempts.min(9)).min(600);
                self.backoff
                    .lock()
                    .await
                    .insert(row.id.clone(), now + Duration::seconds(delay));
            }
            retried += 1;
        }

        (retried, dead)
    }

    /// Retry one FAILED row toward its intended state. Returns true when
    /// the row settled.
    async fn retry_row(&self, row: &LedgerEntry) -> bool {
        let should_be_installed = match (&row.session_id, row.kind) {
            // Session-scoped rules belong with an ACTIVE session.
            (Some(sid), _) => match self.store.get_session(sid).await {
                Some(session) => session.state == SessionState::Active,
                None => false,
            },
            // Portal steering belongs to MACs without an active session.
            (None, RuleKind::PortalRedirect) => {
                self.store.active_session_by_mac(row.mac).await.is_none()
            }
            (None, _) => false,
        };

        if should_be_installed {
            let Some(rule_set) = row.rule_set() else {
                warn!(row = %row.id, "ledger descriptor unreadable; cannot re-apply");
                return false;
            };
            let outcome = self.enforcer.apply(&rule_set).await;
            let ok = outcome.result == ApplyResult::Ok;
            let handles = outcome.handles.clone();
            let diagnostics = outcome.diagnostics.clone();
            self.store
                .update_ledger(&row.id, |e| {
                    e.attempts += 1;
                    if ok {
                        e.state = LedgerState::Applied;
                        e.handles = handles;
                        e.diagnostics.clear();
                    } else {
                        e.diagnostics = diagnostics;
                    }
                })
                .await;
            ok
        } else {
            // Intent is absence: retract whatever the row still holds.
            if row.handles.is_empty() {
                self.store
                    .update_ledger(&row.id, |e| {
                        e.state = LedgerState::Retracted;
                        e.retracted_at = Some(Utc::now());
                    })
                    .await;
                return true;
            }
            let outcome = self.enforcer.retract(&row.handles).await;
            let settled = outcome.still_present.is_empty();
            self.store
                .update_ledger(&row.id, |e| {
                    e.attempts += 1;
                    if settled {
                        e.state = LedgerState::Retracted;
                        e.retracted_at = Some(Utc::now());
                    }
                })
                .await;
            settled
        }
    }

    /// Compare the enforcer snapshot against the ledger. Orphan handles
    /// (installed, not APPLIED anywhere) are retracted; ghost rows
    /// (APPLIED, not installed) are re-applied or failed.
    async fn drift_check(&self) -> (usize, usize) {
        let snapshot = self.enforcer.snapshot().await;
        let ledger = self.store.all_ledger_entries().await;

        let applied_handle_ids: HashSet<&str> = ledger
            .iter()
            .filter(|e| e.state == LedgerState::Applied)
            .flat_map(|e| e.handles.iter().map(|h| h.id.as_str()))
            .collect();
        let installed_ids: HashSet<&str> =
            snapshot.iter().map(|r| r.handle.id.as_str()).collect();

        let orphans: Vec<RuleHandle> = snapshot
            .iter()
            .filter(|r| !applied_handle_ids.contains(r.handle.id.as_str()))
            .map(|r| r.handle.clone())
            .collect();
        let orphan_count = orphans.len();
        if !orphans.is_empty() {
            warn!(count = orphan_count, "retracting orphan enforcer rules");
            self.enforcer.retract(&orphans).await;
            self.sink.emit(
                AuditEvent::new(AuditCategory::Rule, AuditSeverity::Warn, "orphans_retracted")
                    .detail(serde_json::json!({ "count": orphan_count })),
            );
        }

        let mut ghosts = 0;
        for row in ledger
            .iter()
            .filter(|e| e.state == LedgerState::Applied && !e.handles.is_empty())
        {
            let missing = row
                .handles
                .iter()
                .any(|h| !installed_ids.contains(h.id.as_str()));
            if !missing {
                continue;
            }
            ghosts += 1;

            let session_active = match &row.session_id {
                Some(sid) => matches!(
                    self.store.get_session(sid).await,
                    Some(s) if s.state == SessionState::Active
                ),
                None => {
                    row.kind == RuleKind::PortalRedirect
                        && self.store.active_session_by_mac(row.mac).await.is_none()
                }
            };

            if session_active {
                if let Some(rule_set) = row.rule_set() {
                    let outcome = self.enforcer.apply(&rule_set).await;
                    let ok = outcome.result == ApplyResult::Ok;
                    let handles = outcome.handles.clone();
                    self.store
                        .update_ledger(&row.id, |e| {
                            e.attempts += 1;
                            if ok {
                                e.handles = handles;
                            } else {
                                e.state = LedgerState::Failed;
                            }
                        })
                        .await;
                }
            } else {
                self.store
                    .update_ledger(&row.id, |e| {
                        e.state = LedgerState::Failed;
                        e.diagnostics.push("ghost: installed rules vanished".to_string());
                    })
                    .await;
            }
        }

        (orphan_count, ghosts)
    }

    /// Start the periodic loop; the handle cancels it at shutdown
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cadence = std::time::Duration::from_secs(self.config.cadence_secs);
        let drain = std::time::Duration::from_secs(self.config.shutdown_drain_secs);

        let reconciler = self.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately: startup resync.
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        reconciler.run_cycle().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciliation loop stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            join,
            drain,
        }
    }
}

/// Cancellation handle for the running loop
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    drain: std::time::Duration,
}

impl ReconcilerHandle {
    /// Signal the loop and wait for it within the drain window
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(self.drain, self.join).await.is_err() {
            warn!("reconciliation loop did not drain in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::config::EngineConfig;
    use crate::enforcer::SimulatedEnforcer;
    use crate::mac::MacAddr;
    use std::net::Ipv4Addr;

    struct Fixture {
        manager: Arc<SessionManager>,
        reconciler: Arc<Reconciler>,
        enforcer: Arc<SimulatedEnforcer>,
        store: Arc<MemoryStore>,
    }

    fn fixture(grace_secs: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = AuditSink::new(256);
        let mut config = EngineConfig::simulation();
        config.reconciliation.grace_period_secs = grace_secs;
        let registry = Arc::new(BindingRegistry::new(
            store.clone(),
            sink.clone(),
            config.session.rapid_rebind_threshold,
        ));
        let enforcer = Arc::new(SimulatedEnforcer::new());

        let manager = Arc::new(SessionManager::new(
            store.clone(),
            registry.clone(),
            enforcer.clone(),
            sink.clone(),
            &config,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            manager.clone(),
            registry,
            enforcer.clone(),
            sink,
            config.reconciliation.clone(),
        ));

        Fixture {
            manager,
            reconciler,
            enforcer,
            store,
        }
    }

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    #[tokio::test]
    async fn test_quiescent_cycle_is_fixed_point() {
        let f = fixture(0);
        f.manager
            .grant_access(mac(1), Ipv4Addr::new(192, 168, 4, 10), 3600, "voucher")
            .await
            .unwrap();

        // Let the system settle, then measure.
        f.reconciler.run_cycle().await;
        let ledger_before = f.store.all_ledger_entries().await.len();
        let mutations_before = f.enforcer.mutation_calls();

        let report = f.reconciler.run_cycle().await;

        assert!(report.is_quiet());
        assert_eq!(f.enforcer.mutation_calls(), mutations_before);
        assert_eq!(f.store.all_ledger_entries().await.len(), ledger_before);
    }

    #[tokio::test]
    async fn test_expired_session_is_revoked() {
        let f = fixture(0);
        let outcome = f
            .manager
            .grant_access(mac(1), Ipv4Addr::new(192, 168, 4, 10), 1, "voucher")
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let report = f.reconciler.run_cycle().await;

        assert_eq!(report.expired_sessions, 1);
        let session = f.store.get_session(&outcome.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert_eq!(session.revoke_reason, Some(RevokeReason::Expired));
    }

    #[tokio::test]
    async fn test_orphan_rules_are_retracted() {
        let f = fixture(0);
        // Install rules behind the ledger's back.
        let params = f.manager.rule_params().clone();
        let rule_set = crate::rules::portal_redirect(mac(9), &params);
        f.enforcer.apply(&rule_set).await;
        assert!(f.enforcer.installed_count().await > 0);

        let report = f.reconciler.run_cycle().await;

        assert!(report.orphans_retracted > 0);
        assert_eq!(f.enforcer.installed_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_retry_exhaustion_promotes_dead() {
        let f = fixture(0);
        // A FAILED row at the budget goes straight to DEAD.
        let params = f.manager.rule_params().clone();
        let rule_set = crate::rules::portal_redirect(mac(2), &params);
        let mut entry = LedgerEntry::write_ahead(None, &rule_set);
        entry.state = LedgerState::Failed;
        entry.attempts = 3;
        let entry_id = entry.id.clone();
        f.store.append_ledger(entry).await;

        let report = f.reconciler.run_cycle().await;

        assert_eq!(report.dead_rows, 1);
        let rows = f.store.ledger_in_state(LedgerState::Dead).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, entry_id);
    }

    #[tokio::test]
    async fn test_failed_portal_row_is_reapplied() {
        let f = fixture(0);
        let params = f.manager.rule_params().clone();
        let rule_set = crate::rules::portal_redirect(mac(3), &params);
        let mut entry = LedgerEntry::write_ahead(None, &rule_set);
        entry.state = LedgerState::Failed;
        entry.attempts = 1;
        let entry_id = entry.id.clone();
        f.store.append_ledger(entry).await;

        let report = f.reconciler.run_cycle().await;

        assert_eq!(report.retried_rows, 1);
        let rows = f.store.ledger_in_state(LedgerState::Applied).await;
        assert!(rows.iter().any(|r| r.id == entry_id));
        assert!(f.enforcer.installed_count().await > 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_shuts_down() {
        let f = fixture(0);
        let handle = f.reconciler.clone().spawn();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.shutdown().await;
    }
}
