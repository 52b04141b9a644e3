//! Access control engine for a captive-portal Wi-Fi gateway
//!
//! Converts authentication events into coordinated L3/L2 packet-filter
//! transitions, maintains the MAC↔IP binding table used to detect
//! identity spoofing, drives a periodic reconciliation loop that expires
//! sessions and removes stale rules, and exposes an inspection/override
//! surface to an operator console.
//!
//! The enforcement plane is reached only through the [`Enforcer`]
//! capability; SIMULATION mode records intent in memory while ACTIVE
//! mode drives iptables/ebtables on the host. The rule ledger is the
//! record of intent, the enforcer snapshot is reality, and the
//! reconciler bridges the two after partial failures or crashes.

pub mod audit;
pub mod binding;
pub mod config;
pub mod control;
pub mod enforcer;
pub mod error;
pub mod ledger;
pub mod mac;
pub mod reconcile;
pub mod rules;
pub mod session;
pub mod store;

pub use audit::{AuditCategory, AuditEvent, AuditSeverity, AuditSink};
pub use binding::{
    Anomaly, AnomalyKind, Binding, BindingCheck, BindingRegistry, BindingState,
};
pub use config::{EngineConfig, EnforcerMode};
pub use control::{ControlApi, GrantRequest, ManualBindOutcome, RuleSnapshot};
pub use enforcer::{
    ApplyOutcome, ApplyResult, Enforcer, InstalledRule, RetractOutcome, RuleHandle,
    ShellEnforcer, SimulatedEnforcer,
};
pub use error::{EngineError, ErrorCategory, ErrorReport, Result};
pub use ledger::{LedgerEntry, LedgerState};
pub use mac::MacAddr;
pub use reconcile::{CycleReport, Reconciler, ReconcilerHandle};
pub use rules::{RuleBackend, RuleKind, RuleParams, RuleSet};
pub use session::{
    GrantOutcome, RevokeOutcome, RevokeReason, Session, SessionManager, SessionState,
};
pub use store::{Device, MemoryStore};

use std::sync::Arc;
use tracing::{info, warn};

/// Fully wired engine: store, sink, enforcer, registry, manager, and the
/// running reconciliation loop
pub struct AccessEngine {
    control: Arc<ControlApi>,
    sink: AuditSink,
    reconciler_handle: Option<ReconcilerHandle>,
}

impl AccessEngine {
    /// Construct and start the engine with the backend selected by
    /// `enforcer_mode`
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let enforcer: Arc<dyn Enforcer> = match config.mode() {
            EnforcerMode::Simulation => Arc::new(SimulatedEnforcer::new()),
            EnforcerMode::Active => Arc::new(ShellEnforcer::new()),
        };
        Self::start_with_enforcer(config, enforcer).await
    }

    /// Construct and start the engine against a caller-provided backend.
    /// This is the deployment-time binding point; nothing downstream
    /// branches on which implementation it received.
    pub async fn start_with_enforcer(
        config: EngineConfig,
        enforcer: Arc<dyn Enforcer>,
    ) -> Result<Self> {
        config.validate()?;

        let mut config = config;
        if config.network.gateway_mac.is_none() && config.mode() == EnforcerMode::Active {
            match enforcer::shell::discover_gateway_mac(config.network.gateway_ip).await {
                Some(mac) => {
                    info!(gateway_mac = %mac, "discovered gateway hardware address");
                    config.network.gateway_mac = Some(mac);
                }
                None => {
                    warn!(
                        gateway_ip = %config.network.gateway_ip,
                        "gateway MAC not configured and discovery failed; L2 isolation \
                         will use a placeholder address"
                    );
                }
            }
        }

        let store = Arc::new(MemoryStore::new());
        let sink = AuditSink::with_buffer(
            config.audit.retention_events,
            config.audit.buffer_capacity,
        );
        let registry = Arc::new(BindingRegistry::new(
            store.clone(),
            sink.clone(),
            config.session.rapid_rebind_threshold,
        ));
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
            registry.clone(),
            enforcer.clone(),
            sink.clone(),
            config.reconciliation.clone(),
        ));
        let reconciler_handle = reconciler.clone().spawn();

        let control = Arc::new(ControlApi::new(
            store,
            manager,
            registry,
            reconciler,
            enforcer,
            sink.clone(),
            config,
        ));

        sink.emit(AuditEvent::new(
            AuditCategory::System,
            AuditSeverity::Info,
            "engine_started",
        ));

        Ok(Self {
            control,
            sink,
            reconciler_handle: Some(reconciler_handle),
        })
    }

    pub fn control(&self) -> Arc<ControlApi> {
        self.control.clone()
    }

    pub fn sink(&self) -> &AuditSink {
        &self.sink
    }

    /// Orderly shutdown: cancel the reconciler within its drain window
    /// and emit the final audit record
    pub async fn shutdown(mut self) {
        self.sink.emit(AuditEvent::new(
            AuditCategory::System,
            AuditSeverity::Info,
            "engine_stopping",
        ));
        if let Some(handle) = self.reconciler_handle.take() {
            handle.shutdown().await;
        }
        self.sink.emit(AuditEvent::new(
            AuditCategory::System,
            AuditSeverity::Info,
            "engine_stopped",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_starts_and_stops_in_simulation() {
        let engine = AccessEngine::start(EngineConfig::simulation()).await.unwrap();
        let control = engine.control();

        assert!(!control.has_active_session("aa:bb:cc:dd:ee:01").await.unwrap());
        assert!(control.snapshot_rules(None).await.simulated);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = EngineConfig::simulation();
        config.session.default_duration_secs = 0;
        assert!(AccessEngine::start(config).await.is_err());
    }
}
