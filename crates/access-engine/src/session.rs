//! Session lifecycle management
//!
//! State transitions: PENDING → ACTIVE → REVOKING → TERMINATED, no
//! reverse edges. A grant write-aheads its rule intent to the ledger,
//! drives the enforcer through the ordered rule steps, and compensates
//! with a revoke on any partial failure so a session is only ever fully
//! enforced or fully absent. All operations for one MAC serialize on the
//! store's key-lock registry.

use crate::audit::{AuditCategory, AuditEvent, AuditSeverity, AuditSink};
use crate::binding::{Anomaly, BindingRegistry};
use crate::config::EngineConfig;
use crate::enforcer::{ApplyOutcome, ApplyResult, Enforcer, RetractOutcome, RuleHandle};
use crate::error::{EngineError, Result};
use crate::ledger::{LedgerEntry, LedgerState};
use crate::mac::MacAddr;
use crate::rules::{grant_rules, portal_redirect, RuleParams, RuleSet};
use crate::store::MemoryStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Active,
    Revoking,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "PENDING",
            SessionState::Active => "ACTIVE",
            SessionState::Revoking => "REVOKING",
            SessionState::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevokeReason {
    Expired,
    UserLogout,
    Admin,
    Conflict,
    EnforcerFailed,
    Superseded,
    Reconciled,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Expired => "EXPIRED",
            RevokeReason::UserLogout => "USER_LOGOUT",
            RevokeReason::Admin => "ADMIN",
            RevokeReason::Conflict => "CONFLICT",
            RevokeReason::EnforcerFailed => "ENFORCER_FAILED",
            RevokeReason::Superseded => "SUPERSEDED",
            RevokeReason::Reconciled => "RECONCILED",
        }
    }
}

impl FromStr for RevokeReason {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "EXPIRED" => Ok(RevokeReason::Expired),
            "USER_LOGOUT" => Ok(RevokeReason::UserLogout),
            "ADMIN" => Ok(RevokeReason::Admin),
            "CONFLICT" => Ok(RevokeReason::Conflict),
            "ENFORCER_FAILED" => Ok(RevokeReason::EnforcerFailed),
            "SUPERSEDED" => Ok(RevokeReason::Superseded),
            "RECONCILED" => Ok(RevokeReason::Reconciled),
            other => Err(EngineError::InvalidInput(format!(
                "unknown revoke reason: {other}"
            ))),
        }
    }
}

/// One authenticated client's right to egress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub auth_method: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<RevokeReason>,
}

impl Session {
    pub fn new(mac: MacAddr, ip: Ipv4Addr, auth_method: &str, duration_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            mac,
            ip,
            auth_method: auth_method.to_string(),
            state: SessionState::Pending,
            started_at: now,
            expires_at: now + Duration::seconds(duration_secs as i64),
            updated_at: now,
            terminated_at: None,
            revoke_reason: None,
        }
    }
}

/// Successful grant result
#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub session_id: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub expires_at: DateTime<Utc>,
    /// The grant matched an existing active session and changed nothing
    pub reused: bool,
    pub rule_summary: Vec<String>,
    pub warnings: Vec<Anomaly>,
}

/// Successful revoke result
#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub session_id: String,
    pub retracted: Vec<RuleHandle>,
    /// Handles the backend refused to release; reconciliation retries
    pub residual_failures: Vec<RuleHandle>,
}

/// Drives session state, the binding registry, the ledger, and the
/// enforcer as one coordinated unit
pub struct SessionManager {
    store: Arc<MemoryStore>,
    registry: Arc<BindingRegistry>,
    enforcer: Arc<dyn Enforcer>,
    sink: AuditSink,
    params: RuleParams,
    max_duration_secs: u64,
    deadline: std::time::Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<MemoryStore>,
        registry: Arc<BindingRegistry>,
        enforcer: Arc<dyn Enforcer>,
        sink: AuditSink,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            enforcer,
            sink,
            params: RuleParams::from_config(config),
            max_duration_secs: config.session.max_duration_secs,
            deadline: std::time::Duration::from_secs(config.enforcer_deadline_secs),
        }
    }

    /// Override the gateway MAC after startup discovery
    pub fn with_gateway_mac(mut self, gateway_mac: MacAddr) -> Self {
        self.params.gateway_mac = gateway_mac;
        self
    }

    pub fn rule_params(&self) -> &RuleParams {
        &self.params
    }

    /// Grant egress to (mac, ip) for `duration_secs`. A grant for an
    /// already-active MAC with matching inputs returns the existing
    /// session; with differing inputs it replaces it.
    pub async fn grant_access(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        duration_secs: u64,
        auth_method: &str,
    ) -> Result<GrantOutcome> {
        if duration_secs == 0 {
            return Err(EngineError::InvalidInput(
                "duration must be positive".to_string(),
            ));
        }
        if duration_secs > self.max_duration_secs {
            return Err(EngineError::InvalidInput(format!(
                "duration {duration_secs}s exceeds maximum {}s",
                self.max_duration_secs
            )));
        }

        let guard = self.store.lock_mac(mac).await;

        let device = self.store.touch_device(mac).await;
        if device.blocked {
            self.sink.emit(
                AuditEvent::new(AuditCategory::Auth, AuditSeverity::Warn, "grant_blocked")
                    .mac(mac)
                    .ip(ip)
                    .detail(serde_json::json!({ "reason": device.block_reason })),
            );
            return Err(EngineError::PolicyDenied(format!(
                "device {mac} is blocked"
            )));
        }

        if let Some(existing) = self.store.active_session_by_mac(mac).await {
            if existing.ip == ip && existing.auth_method == auth_method {
                info!(mac = %mac, session = %existing.id, "re-grant matches active session");
                let rule_summary = self.applied_summary(&existing.id).await;
                return Ok(GrantOutcome {
                    session_id: existing.id,
                    mac,
                    ip,
                    expires_at: existing.expires_at,
                    reused: true,
                    rule_summary,
                    warnings: Vec::new(),
                });
            }
            // Replacement grant: the prior session goes first.
            self.revoke_locked(&existing, RevokeReason::Superseded).await?;
        }

        let session = Session::new(mac, ip, auth_method, duration_secs);
        let session_id = session.id.clone();
        let expires_at = session.expires_at;
        self.store.insert_session(session).await;

        self.sink.emit(
            AuditEvent::new(AuditCategory::Auth, AuditSeverity::Info, "authenticated")
                .mac(mac)
                .ip(ip)
                .session(session_id.clone())
                .detail(serde_json::json!({
                    "auth_method": auth_method,
                    "duration_secs": duration_secs,
                })),
        );

        let created = self
            .registry
            .create_binding(mac, ip, Some(session_id.clone()), expires_at)
            .await;
        let warnings: Vec<Anomaly> = created
            .conflicts
            .iter()
            .map(|c| c.anomaly.clone())
            .collect();
        let losers: Vec<String> = created
            .conflicts
            .iter()
            .filter_map(|c| c.losing_session.clone())
            .filter(|sid| *sid != session_id)
            .collect();

        // The client is authenticated now; stop steering it to the portal.
        self.retract_portal_rows(mac).await;

        // Write-ahead: the full rule plan is in the ledger before the
        // enforcer sees any of it.
        let mut planned: Vec<(String, RuleSet)> = Vec::new();
        for rule_set in grant_rules(mac, ip, &self.params) {
            let entry = LedgerEntry::write_ahead(Some(session_id.clone()), &rule_set);
            planned.push((entry.id.clone(), rule_set));
            self.store.append_ledger(entry).await;
        }

        let mut rule_summary = Vec::new();
        for (entry_id, rule_set) in &planned {
            let outcome = self.apply_with_deadline(rule_set).await;
            match outcome.result {
                ApplyResult::Ok => {
                    let handles = outcome.handles.clone();
                    self.store
                        .update_ledger(entry_id, |e| {
                            e.state = LedgerState::Applied;
                            e.handles = handles;
                            e.attempts += 1;
                        })
                        .await;
                    rule_summary.push(rule_set.kind.as_str().to_string());
                }
                ApplyResult::Partial | ApplyResult::Failed => {
                    let handles = outcome.handles.clone();
                    let diagnostics = outcome.diagnostics.clone();
                    self.store
                        .update_ledger(entry_id, |e| {
                            e.state = LedgerState::Failed;
                            e.handles = handles;
                            e.diagnostics = diagnostics;
                            e.attempts += 1;
                        })
                        .await;

                    let severity = if outcome.permanent {
                        AuditSeverity::Critical
                    } else {
                        AuditSeverity::Error
                    };
                    self.sink.emit(
                        AuditEvent::new(AuditCategory::Rule, severity, "rule_apply_failed")
                            .mac(mac)
                            .ip(ip)
                            .session(session_id.clone())
                            .detail(serde_json::json!({
                                "kind": rule_set.kind.as_str(),
                                "diagnostics": outcome.diagnostics,
                            })),
                    );

                    // Compensate: tear down whatever landed, restore the
                    // portal steering, terminate the session.
                    if let Some(fresh) = self.store.get_session(&session_id).await {
                        let _ = self
                            .revoke_locked(&fresh, RevokeReason::EnforcerFailed)
                            .await;
                    }

                    drop(guard);
                    self.revoke_conflict_losers(losers).await;

                    let detail = outcome.diagnostics.join("; ");
                    return Err(if outcome.permanent {
                        EngineError::EnforcerPermanent(detail)
                    } else {
                        EngineError::EnforcerTransient(detail)
                    });
                }
            }
        }

        self.store
            .update_session(&session_id, |s| s.state = SessionState::Active)
            .await;
        self.sink.emit(
            AuditEvent::new(AuditCategory::Session, AuditSeverity::Info, "session_activated")
                .mac(mac)
                .ip(ip)
                .session(session_id.clone()),
        );
        info!(mac = %mac, ip = %ip, session = %session_id, "access granted");

        drop(guard);
        self.revoke_conflict_losers(losers).await;

        Ok(GrantOutcome {
            session_id,
            mac,
            ip,
            expires_at,
            reused: false,
            rule_summary,
            warnings,
        })
    }

    /// Revoke a session: retract its rules, retire its binding, restore
    /// portal steering, terminate
    pub async fn revoke_access(
        &self,
        session_id: &str,
        reason: RevokeReason,
    ) -> Result<RevokeOutcome> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        let _guard = self.store.lock_mac(session.mac).await;

        // Re-read under the lock; a concurrent operation may have moved it.
        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        self.revoke_locked(&session, reason).await
    }

    /// Operator-initiated disconnect; same path as revoke, audited ADMIN
    pub async fn force_disconnect(
        &self,
        session_id: &str,
        operator_id: &str,
        note: &str,
    ) -> Result<RevokeOutcome> {
        self.sink.emit(
            AuditEvent::new(AuditCategory::Admin, AuditSeverity::Info, "force_disconnect")
                .session(session_id.to_string())
                .detail(serde_json::json!({
                    "operator": operator_id,
                    "note": note,
                })),
        );
        self.revoke_access(session_id, RevokeReason::Admin).await
    }

    /// Push the expiry clock out without touching the enforcer
    pub async fn extend(&self, session_id: &str, additional_secs: u64) -> Result<DateTime<Utc>> {
        if additional_secs == 0 {
            return Err(EngineError::InvalidInput(
                "extension must be positive".to_string(),
            ));
        }

        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        let _guard = self.store.lock_mac(session.mac).await;

        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        match session.state {
            SessionState::Active => {}
            SessionState::Terminated | SessionState::Revoking => {
                return Err(EngineError::AlreadyTerminated(session_id.to_string()))
            }
            SessionState::Pending => {
                return Err(EngineError::PolicyDenied(
                    "session is not active yet".to_string(),
                ))
            }
        }

        let now = Utc::now();
        if session.expires_at < now {
            return Err(EngineError::PolicyDenied(
                "session clock already expired".to_string(),
            ));
        }

        let new_expiry = session.expires_at + Duration::seconds(additional_secs as i64);
        let total = (new_expiry - session.started_at).num_seconds();
        if total > self.max_duration_secs as i64 {
            return Err(EngineError::InvalidInput(format!(
                "extension pushes session beyond maximum {}s",
                self.max_duration_secs
            )));
        }

        // Session and binding clocks move together.
        self.store
            .update_session(session_id, |s| s.expires_at = new_expiry)
            .await;
        let sid = session_id.to_string();
        self.store
            .transact_bindings(move |bindings| {
                for binding in bindings.values_mut() {
                    if binding.session_id.as_deref() == Some(sid.as_str())
                        && binding.state == crate::binding::BindingState::Active
                    {
                        binding.expires_at = new_expiry;
                    }
                }
            })
            .await;

        self.sink.emit(
            AuditEvent::new(AuditCategory::Session, AuditSeverity::Info, "session_extended")
                .mac(session.mac)
                .session(session_id.to_string())
                .detail(serde_json::json!({ "new_expires_at": new_expiry })),
        );

        Ok(new_expiry)
    }

    /// Portal-facade predicate
    pub async fn has_active_session(&self, mac: MacAddr) -> bool {
        match self.store.active_session_by_mac(mac).await {
            Some(session) => session.expires_at > Utc::now(),
            None => false,
        }
    }

    /// Revoke a session stuck in PENDING/REVOKING since before `cutoff`.
    /// Used by reconciliation to resolve the write-ahead crash window;
    /// re-checks the condition under the MAC lock so an in-flight grant
    /// is never clobbered.
    pub async fn reconcile_stale(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<RevokeOutcome>> {
        let Some(session) = self.store.get_session(session_id).await else {
            return Ok(None);
        };

        let _guard = self.store.lock_mac(session.mac).await;

        let Some(session) = self.store.get_session(session_id).await else {
            return Ok(None);
        };
        let stale = matches!(
            session.state,
            SessionState::Pending | SessionState::Revoking
        ) && session.updated_at < cutoff;
        if !stale {
            return Ok(None);
        }

        let outcome = self.revoke_locked(&session, RevokeReason::Reconciled).await?;
        Ok(Some(outcome))
    }

    // ---- internals ----

    /// Revoke with the MAC guard already held by the caller
    async fn revoke_locked(
        &self,
        session: &Session,
        reason: RevokeReason,
    ) -> Result<RevokeOutcome> {
        if session.state == SessionState::Terminated {
            return Err(EngineError::AlreadyTerminated(session.id.clone()));
        }

        self.store
            .update_session(&session.id, |s| {
                s.state = SessionState::Revoking;
                s.revoke_reason = Some(reason);
            })
            .await;
        info!(
            session = %session.id,
            mac = %session.mac,
            reason = reason.as_str(),
            "revoking session"
        );

        let rows: Vec<LedgerEntry> = self
            .store
            .ledger_for_session(&session.id)
            .await
            .into_iter()
            .filter(|r| !r.is_settled())
            .collect();
        let handles: Vec<RuleHandle> = rows.iter().flat_map(|r| r.handles.clone()).collect();

        let mut retracted = Vec::new();
        let mut residual = Vec::new();
        if !handles.is_empty() {
            let first = self.retract_with_deadline(&handles).await;
            retracted.extend(first.retracted);

            if !first.still_present.is_empty() {
                // One in-path retry; beyond that reconciliation owns it.
                let second = self.retract_with_deadline(&first.still_present).await;
                retracted.extend(second.retracted);
                residual = second.still_present;
            }
        }

        let now = Utc::now();
        for row in &rows {
            let stuck = row
                .handles
                .iter()
                .any(|h| residual.iter().any(|r| r.id == h.id));
            self.store
                .update_ledger(&row.id, |e| {
                    if stuck {
                        e.state = LedgerState::Failed;
                        e.attempts += 1;
                        e.diagnostics.push("retract incomplete".to_string());
                    } else {
                        e.state = LedgerState::Retracted;
                        e.retracted_at = Some(now);
                    }
                })
                .await;
        }

        if !residual.is_empty() {
            warn!(session = %session.id, stuck = residual.len(), "rules stuck after retract retry");
            self.sink.emit(
                AuditEvent::new(AuditCategory::Rule, AuditSeverity::Critical, "retract_stuck")
                    .mac(session.mac)
                    .session(session.id.clone())
                    .detail(serde_json::json!({
                        "handles": residual.iter().map(|h| h.id.clone()).collect::<Vec<_>>(),
                    })),
            );
        }

        self.registry
            .retire_by_session(&session.id, reason.as_str())
            .await;

        // The client must re-authenticate: restore portal steering as a
        // fresh ledger row not tied to the terminating session.
        if self.store.applied_portal_rows(session.mac).await.is_empty() {
            self.apply_portal_redirect(session.mac).await;
        }

        self.store
            .update_session(&session.id, |s| {
                s.state = SessionState::Terminated;
                s.terminated_at = Some(now);
            })
            .await;
        self.sink.emit(
            AuditEvent::new(AuditCategory::Session, AuditSeverity::Info, "session_terminated")
                .mac(session.mac)
                .ip(session.ip)
                .session(session.id.clone())
                .detail(serde_json::json!({ "reason": reason.as_str() })),
        );

        Ok(RevokeOutcome {
            session_id: session.id.clone(),
            retracted,
            residual_failures: residual,
        })
    }

    /// Retract any standing portal-redirect rules for a MAC and settle
    /// their ledger rows
    async fn retract_portal_rows(&self, mac: MacAddr) {
        let rows = self.store.applied_portal_rows(mac).await;
        if rows.is_empty() {
            return;
        }

        let handles: Vec<RuleHandle> = rows.iter().flat_map(|r| r.handles.clone()).collect();
        let outcome = self.retract_with_deadline(&handles).await;
        let now = Utc::now();

        for row in &rows {
            let stuck = row
                .handles
                .iter()
                .any(|h| outcome.still_present.iter().any(|s| s.id == h.id));
            self.store
                .update_ledger(&row.id, |e| {
                    if stuck {
                        e.state = LedgerState::Failed;
                        e.attempts += 1;
                        e.diagnostics.push("portal retract incomplete".to_string());
                    } else {
                        e.state = LedgerState::Retracted;
                        e.retracted_at = Some(now);
                    }
                })
                .await;
        }
    }

    /// Apply portal steering for a MAC with its own write-ahead row
    async fn apply_portal_redirect(&self, mac: MacAddr) {
        let rule_set = portal_redirect(mac, &self.params);
        let entry = LedgerEntry::write_ahead(None, &rule_set);
        let entry_id = entry.id.clone();
        self.store.append_ledger(entry).await;

        let outcome = self.apply_with_deadline(&rule_set).await;
        let ok = outcome.result == ApplyResult::Ok;
        let handles = outcome.handles.clone();
        let diagnostics = outcome.diagnostics.clone();
        self.store
            .update_ledger(&entry_id, |e| {
                e.state = if ok {
                    LedgerState::Applied
                } else {
                    LedgerState::Failed
                };
                e.handles = handles;
                e.diagnostics = diagnostics;
                e.attempts += 1;
            })
            .await;

        if !ok {
            self.sink.emit(
                AuditEvent::new(AuditCategory::Rule, AuditSeverity::Error, "portal_apply_failed")
                    .mac(mac)
                    .detail(serde_json::json!({ "diagnostics": outcome.diagnostics })),
            );
        }
    }

    async fn revoke_conflict_losers(&self, losers: Vec<String>) {
        for loser in losers {
            match self.revoke_access(&loser, RevokeReason::Conflict).await {
                Ok(_) | Err(EngineError::AlreadyTerminated(_)) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(session = %loser, error = %e, "conflict-loser revoke failed");
                }
            }
        }
    }

    async fn applied_summary(&self, session_id: &str) -> Vec<String> {
        self.store
            .ledger_for_session(session_id)
            .await
            .into_iter()
            .filter(|r| r.state == LedgerState::Applied)
            .map(|r| r.kind.as_str().to_string())
            .collect()
    }

    async fn apply_with_deadline(&self, rule_set: &RuleSet) -> ApplyOutcome {
        match timeout(self.deadline, self.enforcer.apply(rule_set)).await {
            Ok(outcome) => outcome,
            Err(_) => ApplyOutcome {
                handles: Vec::new(),
                result: ApplyResult::Failed,
                diagnostics: vec!["RULE_BACKEND_TIMEOUT".to_string()],
                permanent: false,
            },
        }
    }

    async fn retract_with_deadline(&self, handles: &[RuleHandle]) -> RetractOutcome {
        match timeout(self.deadline, self.enforcer.retract(handles)).await {
            Ok(outcome) => outcome,
            Err(_) => RetractOutcome {
                retracted: Vec::new(),
                still_present: handles.to_vec(),
                missing: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::SimulatedEnforcer;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 4, n)
    }

    fn manager() -> (SessionManager, Arc<SimulatedEnforcer>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sink = AuditSink::new(256);
        let config = EngineConfig::simulation();
        let registry = Arc::new(BindingRegistry::new(
            store.clone(),
            sink.clone(),
            config.session.rapid_rebind_threshold,
        ));
        let enforcer = Arc::new(SimulatedEnforcer::new());
        let manager = SessionManager::new(
            store.clone(),
            registry,
            enforcer.clone(),
            sink,
            &config,
        );
        (manager, enforcer, store)
    }

    #[tokio::test]
    async fn test_grant_activates_session() {
        let (manager, _enforcer, store) = manager();

        let outcome = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.rule_summary.len(), 4);

        let session = store.get_session(&outcome.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert!(session.expires_at > session.started_at);
    }

    #[tokio::test]
    async fn test_regrant_same_inputs_is_idempotent() {
        let (manager, _enforcer, _store) = manager();

        let first = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();
        let second = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();

        assert!(second.reused);
        assert_eq!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn test_regrant_new_ip_replaces() {
        let (manager, _enforcer, store) = manager();

        let first = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();
        let second = manager
            .grant_access(mac(1), ip(20), 3600, "voucher")
            .await
            .unwrap();

        assert_ne!(second.session_id, first.session_id);
        let old = store.get_session(&first.session_id).await.unwrap();
        assert_eq!(old.state, SessionState::Terminated);
        assert_eq!(old.revoke_reason, Some(RevokeReason::Superseded));
    }

    #[tokio::test]
    async fn test_blocked_device_is_denied() {
        let (manager, _enforcer, store) = manager();
        store
            .set_device_blocked(mac(1), true, Some("operator ban".to_string()))
            .await;

        let err = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn test_duration_bounds() {
        let (manager, _enforcer, _store) = manager();

        assert!(manager
            .grant_access(mac(1), ip(10), 0, "voucher")
            .await
            .is_err());
        assert!(manager
            .grant_access(mac(1), ip(10), 1_000_000, "voucher")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_revoke_unknown_session() {
        let (manager, _enforcer, _store) = manager();
        let err = manager
            .revoke_access("no-such-session", RevokeReason::UserLogout)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_revoke_twice_short_circuits() {
        let (manager, _enforcer, _store) = manager();
        let outcome = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();

        manager
            .revoke_access(&outcome.session_id, RevokeReason::UserLogout)
            .await
            .unwrap();
        let err = manager
            .revoke_access(&outcome.session_id, RevokeReason::UserLogout)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminated(_)));
    }

    #[tokio::test]
    async fn test_extend_moves_both_clocks() {
        let (manager, _enforcer, store) = manager();
        let outcome = manager
            .grant_access(mac(1), ip(10), 600, "voucher")
            .await
            .unwrap();

        let new_expiry = manager.extend(&outcome.session_id, 600).await.unwrap();
        assert!(new_expiry > outcome.expires_at);

        let session = store.get_session(&outcome.session_id).await.unwrap();
        assert_eq!(session.expires_at, new_expiry);
        let binding = store.active_binding_by_mac(mac(1)).await.unwrap();
        assert_eq!(binding.expires_at, new_expiry);
    }

    #[tokio::test]
    async fn test_extend_respects_maximum() {
        let (manager, _enforcer, _store) = manager();
        let outcome = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();

        let err = manager
            .extend(&outcome.session_id, 1_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_has_active_session_predicate() {
        let (manager, _enforcer, _store) = manager();
        assert!(!manager.has_active_session(mac(1)).await);

        let outcome = manager
            .grant_access(mac(1), ip(10), 3600, "voucher")
            .await
            .unwrap();
        assert!(manager.has_active_session(mac(1)).await);

        manager
            .revoke_access(&outcome.session_id, RevokeReason::UserLogout)
            .await
            .unwrap();
        assert!(!manager.has_active_session(mac(1)).await);
    }

    #[test]
    fn test_revoke_reason_round_trip() {
        for reason in [
            RevokeReason::Expired,
            RevokeReason::UserLogout,
            RevokeReason::Admin,
            RevokeReason::Conflict,
        ] {
            let parsed: RevokeReason = reason.as_str().parse().unwrap();
            assert_eq!(parsed, reason);
        }
        assert!("NOT_A_REASON".parse::<RevokeReason>().is_err());
    }
}
