//! Control and inspection surface
//!
//! Thin adapter over the lifecycle manager, registry, ledger, and
//! reconciler. The HTTP layer binds to these operations one-to-one;
//! everything here takes wire-shaped inputs (strings), validates them
//! into engine types, and delegates.

use crate::audit::{AuditCategory, AuditEvent, AuditSeverity, AuditSink};
use crate::binding::{Anomaly, Binding, BindingCheck, BindingRegistry};
use crate::config::{EngineConfig, EnforcerMode};
use crate::enforcer::{Enforcer, InstalledRule};
use crate::error::{EngineError, Result};
use crate::mac::{parse_ipv4, MacAddr};
use crate::reconcile::{CycleReport, Reconciler};
use crate::session::{GrantOutcome, RevokeOutcome, RevokeReason, Session, SessionManager, SessionState};
use crate::store::{Device, MemoryStore};
use crate::rules::RuleBackend;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire-shaped grant request
#[derive(Debug, Clone, Deserialize)]
pub struct GrantRequest {
    pub mac: String,
    pub ip: String,
    /// Defaults to the configured session duration
    pub duration_secs: Option<u64>,
    pub auth_method: String,
}

/// Result of a manual operator bind
#[derive(Debug, Clone, Serialize)]
pub struct ManualBindOutcome {
    pub binding_id: String,
    pub warnings: Vec<Anomaly>,
}

/// Installed-rule view for operators
#[derive(Debug, Clone, Serialize)]
pub struct RuleSnapshot {
    pub simulated: bool,
    pub rules: Vec<InstalledRule>,
}

/// The operator-facing engine surface
pub struct ControlApi {
    store: Arc<MemoryStore>,
    manager: Arc<SessionManager>,
    registry: Arc<BindingRegistry>,
    reconciler: Arc<Reconciler>,
    enforcer: Arc<dyn Enforcer>,
    sink: AuditSink,
    config: EngineConfig,
}

impl ControlApi {
    pub fn new(
        store: Arc<MemoryStore>,
        manager: Arc<SessionManager>,
        registry: Arc<BindingRegistry>,
        reconciler: Arc<Reconciler>,
        enforcer: Arc<dyn Enforcer>,
        sink: AuditSink,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
            reconciler,
            enforcer,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn grant(&self, request: GrantRequest) -> Result<GrantOutcome> {
        let mac: MacAddr = request.mac.parse()?;
        let ip = parse_ipv4(&request.ip)?;
        let duration = request
            .duration_secs
            .unwrap_or(self.config.session.default_duration_secs);
        if request.auth_method.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "auth_method must not be empty".to_string(),
            ));
        }
        self.manager
            .grant_access(mac, ip, duration, request.auth_method.trim())
            .await
    }

    pub async fn revoke(&self, session_id: &str, reason: RevokeReason) -> Result<RevokeOutcome> {
        self.manager.revoke_access(session_id, reason).await
    }

    pub async fn force_disconnect(
        &self,
        session_id: &str,
        operator_id: &str,
        note: &str,
    ) -> Result<RevokeOutcome> {
        self.manager
            .force_disconnect(session_id, operator_id, note)
            .await
    }

    pub async fn extend(&self, session_id: &str, additional_secs: u64) -> Result<DateTime<Utc>> {
        self.manager.extend(session_id, additional_secs).await
    }

    /// ACTIVE sessions, optionally filtered to one MAC
    pub async fn list_active_sessions(&self, mac_filter: Option<&str>) -> Result<Vec<Session>> {
        let filter = match mac_filter {
            Some(raw) => Some(raw.parse::<MacAddr>()?),
            None => None,
        };
        let mut sessions = self.store.active_sessions().await;
        if let Some(mac) = filter {
            sessions.retain(|s| s.mac == mac);
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    pub async fn list_bindings(&self) -> Vec<Binding> {
        let mut bindings = self.store.active_bindings().await;
        bindings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        bindings
    }

    pub async fn validate(&self, mac: &str, ip: &str) -> Result<BindingCheck> {
        let mac: MacAddr = mac.parse()?;
        let ip = parse_ipv4(ip)?;
        Ok(self.registry.validate(mac, ip).await)
    }

    /// Installed rules as the enforcer reports them, optionally filtered
    /// by backend plane
    pub async fn snapshot_rules(&self, backend: Option<RuleBackend>) -> RuleSnapshot {
        let mut rules = self.enforcer.snapshot().await;
        if let Some(backend) = backend {
            rules.retain(|r| r.handle.backend == backend);
        }
        RuleSnapshot {
            simulated: self.config.mode() == EnforcerMode::Simulation,
            rules,
        }
    }

    /// Operator identity pin without a session; no rules are synthesized
    pub async fn manual_bind(
        &self,
        mac: &str,
        ip: &str,
        duration_secs: Option<u64>,
    ) -> Result<ManualBindOutcome> {
        let mac: MacAddr = mac.parse()?;
        let ip = parse_ipv4(ip)?;
        let duration = duration_secs.unwrap_or(self.config.session.default_duration_secs);
        let expires_at = Utc::now() + Duration::seconds(duration as i64);

        let created = self.registry.create_binding(mac, ip, None, expires_at).await;
        self.sink.emit(
            AuditEvent::new(AuditCategory::Admin, AuditSeverity::Info, "manual_bind")
                .mac(mac)
                .ip(ip),
        );

        Ok(ManualBindOutcome {
            binding_id: created.binding_id,
            warnings: created.conflicts.into_iter().map(|c| c.anomaly).collect(),
        })
    }

    pub async fn manual_unbind(&self, mac: &str) -> Result<usize> {
        let mac: MacAddr = mac.parse()?;
        let retired = self.registry.retire_by_mac(mac, "manual_unbind").await;
        self.sink.emit(
            AuditEvent::new(AuditCategory::Admin, AuditSeverity::Info, "manual_unbind")
                .mac(mac)
                .detail(serde_json::json!({ "retired": retired })),
        );
        Ok(retired)
    }

    /// Run one reconciliation cycle now
    pub async fn trigger_cleanup(&self) -> CycleReport {
        self.reconciler.run_cycle().await
    }

    /// Portal-facade predicate: does this MAC hold an unexpired ACTIVE
    /// session?
    pub async fn has_active_session(&self, mac: &str) -> Result<bool> {
        let mac: MacAddr = mac.parse()?;
        Ok(self.manager.has_active_session(mac).await)
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        let mut devices = self.store.list_devices().await;
        devices.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        devices
    }

    /// Block future grants for a MAC; any active session is disconnected
    pub async fn block_device(
        &self,
        mac: &str,
        reason: &str,
        operator_id: &str,
    ) -> Result<Device> {
        let mac: MacAddr = mac.parse()?;
        let device = self
            .store
            .set_device_blocked(mac, true, Some(reason.to_string()))
            .await;

        self.sink.emit(
            AuditEvent::new(AuditCategory::Admin, AuditSeverity::Warn, "device_blocked")
                .mac(mac)
                .detail(serde_json::json!({
                    "operator": operator_id,
                    "reason": reason,
                })),
        );

        if let Some(session) = self.store.active_session_by_mac(mac).await {
            if session.state == SessionState::Active {
                let _ = self
                    .manager
                    .force_disconnect(&session.id, operator_id, reason)
                    .await;
            }
        }

        Ok(device)
    }

    pub async fn unblock_device(&self, mac: &str, operator_id: &str) -> Result<Device> {
        let mac: MacAddr = mac.parse()?;
        let device = self.store.set_device_blocked(mac, false, None).await;
        self.sink.emit(
            AuditEvent::new(AuditCategory::Admin, AuditSeverity::Info, "device_unblocked")
                .mac(mac)
                .detail(serde_json::json!({ "operator": operator_id })),
        );
        Ok(device)
    }

    /// Most recent audit events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<AuditEvent> {
        self.sink.recent(limit.min(1000))
    }

    pub fn dropped_events(&self) -> u64 {
        self.sink.dropped()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<AuditEvent> {
        self.sink.subscribe()
    }
}

/// Parse the `backend` query value of `snapshotRules`
pub fn parse_backend(raw: &str) -> Result<RuleBackend> {
    match raw.to_ascii_lowercase().as_str() {
        "l3" => Ok(RuleBackend::L3),
        "l2" => Ok(RuleBackend::L2),
        other => Err(EngineError::InvalidInput(format!(
            "unknown backend: {other}"
        ))),
    }
}
