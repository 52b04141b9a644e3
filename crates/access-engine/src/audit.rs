//! Audit / event sink
//!
//! Structured event emission off the hot path: a bounded drop-oldest
//! ring for inspection, a broadcast feed for live subscribers, and a
//! mirrored tracing record at the mapped level. `emit` never suspends
//! and never blocks on a slow consumer.

use crate::mac::MacAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Auth,
    Session,
    Binding,
    Rule,
    Anomaly,
    Admin,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Auth => "AUTH",
            AuditCategory::Session => "SESSION",
            AuditCategory::Binding => "BINDING",
            AuditCategory::Rule => "RULE",
            AuditCategory::Anomaly => "ANOMALY",
            AuditCategory::Admin => "ADMIN",
            AuditCategory::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// One structured audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    /// Short machine-readable event name, e.g. `session_activated`
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        category: AuditCategory,
        severity: AuditSeverity,
        event: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            severity,
            event: event.into(),
            mac: None,
            ip: None,
            session_id: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

struct SinkInner {
    ring: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    feed: broadcast::Sender<AuditEvent>,
}

/// Cloneable handle to the shared sink
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<SinkInner>,
}

impl AuditSink {
    /// `retention` bounds the inspection ring; the live-subscriber
    /// channel gets the same depth
    pub fn new(retention: usize) -> Self {
        Self::with_buffer(retention, retention)
    }

    pub fn with_buffer(retention: usize, buffer: usize) -> Self {
        let capacity = retention.max(1);
        let (feed, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(SinkInner {
                ring: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                dropped: AtomicU64::new(0),
                feed,
            }),
        }
    }

    /// Record an event. Non-blocking: a full ring drops its oldest entry
    /// and counts the loss; subscribers that lag are skipped past.
    pub fn emit(&self, event: AuditEvent) {
        match event.severity {
            AuditSeverity::Debug => debug!(
                category = event.category.as_str(),
                event = %event.event,
                mac = ?event.mac,
                session = ?event.session_id,
                "audit"
            ),
            AuditSeverity::Info => info!(
                category = event.category.as_str(),
                event = %event.event,
                mac = ?event.mac,
                session = ?event.session_id,
                "audit"
            ),
            AuditSeverity::Warn => warn!(
                category = event.category.as_str(),
                event = %event.event,
                mac = ?event.mac,
                session = ?event.session_id,
                "audit"
            ),
            AuditSeverity::Error | AuditSeverity::Critical => error!(
                category = event.category.as_str(),
                event = %event.event,
                mac = ?event.mac,
                session = ?event.session_id,
                "audit"
            ),
        }

        {
            let mut ring = self.inner.ring.lock().expect("audit ring poisoned");
            if ring.len() == self.inner.capacity {
                ring.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            ring.push_back(event.clone());
        }

        // No receivers is fine; the ring already has the record.
        let _ = self.inner.feed.send(event);
    }

    /// Most recent `n` events, oldest first
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let ring = self.inner.ring.lock().expect("audit ring poisoned");
        ring.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.inner.feed.subscribe()
    }
}
