//! MAC↔IP binding registry
//!
//! Authoritative identity map for the client segment. At most one active
//! binding per MAC and per IP; conflicting bindings are retired inside
//! the same table transaction that installs their replacement, and every
//! retirement is surfaced as an anomaly through the audit sink.

use crate::audit::{AuditCategory, AuditEvent, AuditSeverity, AuditSink};
use crate::mac::MacAddr;
use crate::store::MemoryStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingState {
    Active,
    Retired,
}

/// A live (MAC, IP) association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    /// `None` for operator manual binds
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: BindingState,
    pub retired_at: Option<DateTime<Utc>>,
    pub retire_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    IpConflict,
    MacRebound,
    RapidRebind,
    BindingMismatch,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::IpConflict => "IP_CONFLICT",
            AnomalyKind::MacRebound => "MAC_REBOUND",
            AnomalyKind::RapidRebind => "RAPID_REBIND",
            AnomalyKind::BindingMismatch => "BINDING_MISMATCH",
        }
    }
}

/// Derived observation, surfaced via the audit sink rather than stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub macs: Vec<MacAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    pub session_ids: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

/// One conflict resolved during binding creation; carries the session
/// that lost its binding so the lifecycle layer can revoke it
#[derive(Debug, Clone)]
pub struct BindingConflict {
    pub anomaly: Anomaly,
    pub losing_session: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedBinding {
    pub binding_id: String,
    pub conflicts: Vec<BindingConflict>,
}

/// Result of a validate read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingCheck {
    Ok,
    NoBinding,
    IpMismatch { expected: Ipv4Addr },
    Expired,
}

/// Authoritative MAC↔IP map with spoof/conflict detection
pub struct BindingRegistry {
    store: Arc<MemoryStore>,
    sink: AuditSink,
    /// Bindings per MAC per hour beyond which churn is anomalous;
    /// from `session.rapid_rebind_threshold`
    rapid_rebind_threshold: usize,
}

impl BindingRegistry {
    pub fn new(store: Arc<MemoryStore>, sink: AuditSink, rapid_rebind_threshold: usize) -> Self {
        Self {
            store,
            sink,
            rapid_rebind_threshold,
        }
    }

    /// Install a binding for (mac, ip), retiring whatever it displaces.
    /// The whole mutation is one table transaction.
    pub async fn create_binding(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        session_id: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> CreatedBinding {
        let now = Utc::now();
        let binding_id = Uuid::new_v4().to_string();

        let conflicts = self
            .store
            .transact_bindings(|bindings| {
                let mut conflicts = Vec::new();

                for existing in bindings.values_mut() {
                    if existing.state != BindingState::Active {
                        continue;
                    }

                    let kind = if existing.mac == mac && existing.ip == ip {
                        // Same identity re-bound: the new row supersedes
                        // it without an anomaly.
                        existing.state = BindingState::Retired;
                        existing.retired_at = Some(now);
                        existing.retire_reason = Some("superseded".to_string());
                        continue;
                    } else if existing.mac == mac {
                        AnomalyKind::MacRebound
                    } else if existing.ip == ip {
                        AnomalyKind::IpConflict
                    } else {
                        continue;
                    };

                    existing.state = BindingState::Retired;
                    existing.retired_at = Some(now);
                    existing.retire_reason = Some(kind.as_str().to_string());

                    let mut macs = vec![existing.mac];
                    if existing.mac != mac {
                        macs.push(mac);
                    }
                    let mut session_ids: Vec<String> =
                        existing.session_id.iter().cloned().collect();
                    session_ids.extend(session_id.iter().cloned());

                    conflicts.push(BindingConflict {
                        anomaly: Anomaly {
                            kind,
                            macs,
                            ip: Some(existing.ip),
                            session_ids,
                            observed_at: now,
                        },
                        losing_session: existing.session_id.clone(),
                    });
                }

                bindings.insert(
                    binding_id.clone(),
                    Binding {
                        id: binding_id.clone(),
                        mac,
                        ip,
                        session_id: session_id.clone(),
                        created_at: now,
                        expires_at,
                        state: BindingState::Active,
                        retired_at: None,
                        retire_reason: None,
                    },
                );

                conflicts
            })
            .await;

        for conflict in &conflicts {
            warn!(
                kind = conflict.anomaly.kind.as_str(),
                mac = %mac,
                ip = %ip,
                "binding conflict resolved"
            );
            self.sink.emit(
                AuditEvent::new(
                    AuditCategory::Anomaly,
                    AuditSeverity::Warn,
                    conflict.anomaly.kind.as_str().to_lowercase(),
                )
                .mac(mac)
                .ip(ip)
                .detail(serde_json::to_value(&conflict.anomaly).unwrap_or_default()),
            );
        }

        CreatedBinding {
            binding_id,
            conflicts,
        }
    }

    /// Pure read. A mismatch is the spoof signal and is audited WARN.
    pub async fn validate(&self, mac: MacAddr, ip: Ipv4Addr) -> BindingCheck {
        let Some(binding) = self.store.active_binding_by_mac(mac).await else {
            return BindingCheck::NoBinding;
        };

        if binding.expires_at < Utc::now() {
            return BindingCheck::Expired;
        }

        if binding.ip != ip {
            self.sink.emit(
                AuditEvent::new(
                    AuditCategory::Binding,
                    AuditSeverity::Warn,
                    "ip_mismatch",
                )
                .mac(mac)
                .ip(ip)
                .detail(serde_json::json!({
                    "expected_ip": binding.ip.to_string(),
                    "observed_ip": ip.to_string(),
                })),
            );
            return BindingCheck::IpMismatch {
                expected: binding.ip,
            };
        }

        BindingCheck::Ok
    }

    /// Retire the active binding for a MAC. Idempotent.
    pub async fn retire_by_mac(&self, mac: MacAddr, reason: &str) -> usize {
        self.retire_where(|b| b.mac == mac, reason).await
    }

    /// Retire bindings owned by a session. Idempotent.
    pub async fn retire_by_session(&self, session_id: &str, reason: &str) -> usize {
        self.retire_where(|b| b.session_id.as_deref() == Some(session_id), reason)
            .await
    }

    async fn retire_where<F>(&self, matches: F, reason: &str) -> usize
    where
        F: Fn(&Binding) -> bool,
    {
        let now = Utc::now();
        let reason = reason.to_string();
        self.store
            .transact_bindings(move |bindings| {
                let mut retired = 0;
                for binding in bindings.values_mut() {
                    if binding.state == BindingState::Active && matches(binding) {
                        binding.state = BindingState::Retired;
                        binding.retired_at = Some(now);
                        binding.retire_reason = Some(reason.clone());
                        retired += 1;
                    }
                }
                retired
            })
            .await
    }

    /// Periodic sweep: duplicate active IPs (a bug if ever observed) and
    /// per-MAC rebind churn over the last hour
    pub async fn scan_anomalies(&self) -> Vec<Anomaly> {
        let now = Utc::now();
        let mut anomalies = Vec::new();

        let active = self.store.active_bindings().await;
        let mut by_ip: HashMap<Ipv4Addr, Vec<&Binding>> = HashMap::new();
        for binding in &active {
            by_ip.entry(binding.ip).or_default().push(binding);
        }
        for (ip, group) in by_ip {
            if group.len() >= 2 {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::BindingMismatch,
                    macs: group.iter().map(|b| b.mac).collect(),
                    ip: Some(ip),
                    session_ids: group
                        .iter()
                        .filter_map(|b| b.session_id.clone())
                        .collect(),
                    observed_at: now,
                });
            }
        }

        let recent = self
            .store
            .bindings_created_since(now - Duration::hours(1))
            .await;
        let mut churn: HashMap<MacAddr, usize> = HashMap::new();
        for binding in &recent {
            *churn.entry(binding.mac).or_default() += 1;
        }
        for (mac, count) in churn {
            if count > self.rapid_rebind_threshold {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::RapidRebind,
                    macs: vec![mac],
                    ip: None,
                    session_ids: Vec::new(),
                    observed_at: now,
                });
            }
        }

        for anomaly in &anomalies {
            let severity = match anomaly.kind {
                AnomalyKind::BindingMismatch => AuditSeverity::Error,
                _ => AuditSeverity::Warn,
            };
            self.sink.emit(
                AuditEvent::new(
                    AuditCategory::Anomaly,
                    severity,
                    anomaly.kind.as_str().to_lowercase(),
                )
                .detail(serde_json::to_value(anomaly).unwrap_or_default()),
            );
        }

        anomalies
    }
}
