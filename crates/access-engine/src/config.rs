//! Engine configuration
//!
//! One immutable configuration object passed to constructors at process
//! start. Every section has defaults suitable for a simulated gateway on
//! a 192.168.4.0/24 segment; deployments load a JSON document over them.

use crate::error::{EngineError, Result};
use crate::mac::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Which rule backend the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcerMode {
    /// Record intent in memory; never touch the host
    Simulation,
    /// Drive iptables/ebtables on the host
    Active,
}

/// Client-facing and upstream interface names, passed opaquely to the
/// rule backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfacesConfig {
    pub lan: String,
    pub wan: String,
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            lan: "wlan0".to_string(),
            wan: "eth0".to_string(),
        }
    }
}

/// Gateway segment addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the portal HTTP server listens on
    pub portal_ip: Ipv4Addr,
    pub portal_port: u16,

    /// Client subnet in CIDR notation (opaque to the engine)
    pub subnet_cidr: String,

    pub gateway_ip: Ipv4Addr,

    /// Gateway hardware address; discovered at startup when absent
    pub gateway_mac: Option<MacAddr>,

    /// Redirect TCP 443 as well as 80. Causes certificate warnings on
    /// clients; accepted breakage for captive portals.
    pub redirect_https: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            portal_ip: Ipv4Addr::new(192, 168, 4, 1),
            portal_port: 8080,
            subnet_cidr: "192.168.4.0/24".to_string(),
            gateway_ip: Ipv4Addr::new(192, 168, 4, 1),
            gateway_mac: None,
            redirect_https: true,
        }
    }
}

/// Session clock policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_duration_secs: u64,
    pub max_duration_secs: u64,

    /// Slack added to the expiry clock before reconciliation revokes
    pub grace_period_secs: u64,

    /// Ceiling enforced by the credential facade; recorded here so the
    /// engine can surface it to operators
    pub max_devices_per_credential: u32,

    /// Bindings created for one MAC within an hour beyond which the
    /// anomaly sweep reports RAPID_REBIND
    pub rapid_rebind_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 3600,
            max_duration_secs: 86400,
            grace_period_secs: 5,
            max_devices_per_credential: 5,
            rapid_rebind_threshold: 6,
        }
    }
}

/// Reconciliation loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub cadence_secs: u64,
    pub grace_period_secs: u64,

    /// Retries for a FAILED ledger row before promotion to DEAD
    pub retry_budget: u32,

    /// Compare the enforcer snapshot against the ledger each cycle
    pub drift_check: bool,

    /// Bound on how long shutdown waits for an in-flight cycle
    pub shutdown_drain_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 60,
            grace_period_secs: 5,
            retry_budget: 3,
            drift_check: true,
            shutdown_drain_secs: 5,
        }
    }
}

/// Audit sink sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events retained in memory for inspection (drop-oldest beyond)
    pub retention_events: usize,
    /// Live-subscriber channel depth
    pub buffer_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_events: 1024,
            buffer_capacity: 256,
        }
    }
}

/// Authentication-attempt ceiling, enforced by the HTTP facade; the
/// engine only honors the device blocks it produces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub interfaces: InterfacesConfig,
    pub network: NetworkConfig,
    pub enforcer_mode: EnforcerMode,
    pub session: SessionConfig,
    pub reconciliation: ReconciliationConfig,
    pub audit: AuditConfig,
    pub rate_limit: RateLimitConfig,

    /// Deadline on every enforcer operation
    pub enforcer_deadline_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interfaces: InterfacesConfig::default(),
            network: NetworkConfig::default(),
            enforcer_mode: EnforcerMode::Simulation,
            session: SessionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            audit: AuditConfig::default(),
            rate_limit: RateLimitConfig::default(),
            enforcer_deadline_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(data)
            .map_err(|e| EngineError::InvalidInput(format!("configuration parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enforcer_deadline_secs == 0 {
            return Err(EngineError::InvalidInput(
                "enforcer_deadline_secs must be positive".to_string(),
            ));
        }
        if self.session.default_duration_secs == 0 {
            return Err(EngineError::InvalidInput(
                "session.default_duration_secs must be positive".to_string(),
            ));
        }
        if self.session.default_duration_secs > self.session.max_duration_secs {
            return Err(EngineError::InvalidInput(
                "session.default_duration_secs exceeds session.max_duration_secs".to_string(),
            ));
        }
        if self.reconciliation.cadence_secs == 0 {
            return Err(EngineError::InvalidInput(
                "reconciliation.cadence_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Simulation defaults, used by tests and the one-shot CLI commands
    pub fn simulation() -> Self {
        Self {
            enforcer_mode: EnforcerMode::Simulation,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> EnforcerMode {
        self.enforcer_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_simulation() {
        let config = EngineConfig::simulation();
        assert_eq!(config.mode(), EnforcerMode::Simulation);
        assert!(config.network.redirect_https);
        assert_eq!(config.reconciliation.cadence_secs, 60);
    }

    #[test]
    fn test_from_json_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{
                "interfaces": { "lan": "wlan1", "wan": "ppp0" },
                "enforcer_mode": "active",
                "session": {
                    "default_duration_secs": 600,
                    "max_duration_secs": 7200,
                    "grace_period_secs": 2,
                    "max_devices_per_credential": 3
                },
                "enforcer_deadline_secs": 10
            }"#,
        )
        .unwrap();

        assert_eq!(config.interfaces.lan, "wlan1");
        assert_eq!(config.mode(), EnforcerMode::Active);
        assert_eq!(config.session.default_duration_secs, 600);
        assert_eq!(config.enforcer_deadline_secs, 10);
        // untouched sections and fields keep defaults
        assert_eq!(config.reconciliation.retry_budget, 3);
        assert_eq!(config.session.rapid_rebind_threshold, 6);
    }

    #[test]
    fn test_rapid_rebind_threshold_override() {
        let config = EngineConfig::from_json_str(
            r#"{ "session": { "rapid_rebind_threshold": 2 } }"#,
        )
        .unwrap();

        assert_eq!(config.session.rapid_rebind_threshold, 2);
        // the rest of the section keeps its defaults
        assert_eq!(config.session.default_duration_secs, 3600);
    }

    #[test]
    fn test_validation_rejects_inverted_durations() {
        let result = EngineConfig::from_json_str(
            r#"{ "session": { "default_duration_secs": 7200,
                              "max_duration_secs": 3600,
                              "grace_period_secs": 5,
                              "max_devices_per_credential": 5 } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_error_is_invalid_input() {
        let err = EngineConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
