//! In-process state store
//!
//! Holds the four logical tables (sessions, bindings, ledger, devices)
//! behind table-level locks, plus the per-MAC key-lock registry that
//! serializes grant/revoke sequences. Mutations inside one table lock are
//! the engine's transactions; no lock is ever held across an enforcer
//! call. The durable persistence engine is an external collaborator —
//! this store is the in-process stand-in the engine is written against.

use crate::binding::{Binding, BindingState};
use crate::ledger::{LedgerEntry, LedgerState};
use crate::mac::MacAddr;
use crate::rules::RuleKind;
use crate::session::{Session, SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Per-MAC hardware record; blocks gate grants regardless of credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub mac: MacAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

/// Tables plus the MAC key-lock registry
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    bindings: RwLock<HashMap<String, Binding>>,
    ledger: RwLock<Vec<LedgerEntry>>,
    devices: RwLock<HashMap<MacAddr, Device>>,
    mac_locks: StdMutex<HashMap<MacAddr, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            ledger: RwLock::new(Vec::new()),
            devices: RwLock::new(HashMap::new()),
            mac_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Serialize all lifecycle operations for one MAC. The guard may be
    /// held across enforcer calls; table locks may not.
    pub async fn lock_mac(&self, mac: MacAddr) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.mac_locks.lock().expect("mac lock registry poisoned");
            locks.entry(mac).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }

    // ---- sessions ----

    pub async fn insert_session(&self, session: Session) {
        self.sessions.write().await.insert(session.id.clone(), session);
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Apply a mutation to one session, returning the updated row
    pub async fn update_session<F>(&self, id: &str, f: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        f(session);
        session.updated_at = Utc::now();
        Some(session.clone())
    }

    pub async fn active_session_by_mac(&self, mac: MacAddr) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.mac == mac && s.state == SessionState::Active)
            .cloned()
    }

    pub async fn active_sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::Active)
            .cloned()
            .collect()
    }

    pub async fn all_sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// ACTIVE sessions whose expiry clock passed `cutoff`
    pub async fn expired_active_sessions(&self, cutoff: DateTime<Utc>) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::Active && s.expires_at < cutoff)
            .cloned()
            .collect()
    }

    /// Sessions stuck in a transitional state since before `cutoff`;
    /// these are the residue of a crash between write-ahead and outcome
    pub async fn stale_transitional_sessions(&self, cutoff: DateTime<Utc>) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| {
                matches!(s.state, SessionState::Pending | SessionState::Revoking)
                    && s.updated_at < cutoff
            })
            .cloned()
            .collect()
    }

    // ---- bindings ----

    /// Run one atomic mutation over the binding table. Conflict
    /// retirement plus insertion of the replacement happens inside a
    /// single call so B1/B2 hold at every observation point.
    pub async fn transact_bindings<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, Binding>) -> R,
    {
        let mut bindings = self.bindings.write().await;
        f(&mut bindings)
    }

    pub async fn active_binding_by_mac(&self, mac: MacAddr) -> Option<Binding> {
        self.bindings
            .read()
            .await
            .values()
            .find(|b| b.mac == mac && b.state == BindingState::Active)
            .cloned()
    }

    pub async fn active_binding_by_ip(&self, ip: Ipv4Addr) -> Option<Binding> {
        self.bindings
            .read()
            .await
            .values()
            .find(|b| b.ip == ip && b.state == BindingState::Active)
            .cloned()
    }

    pub async fn active_bindings(&self) -> Vec<Binding> {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| b.state == BindingState::Active)
            .cloned()
            .collect()
    }

    pub async fn all_bindings(&self) -> Vec<Binding> {
        self.bindings.read().await.values().cloned().collect()
    }

    /// ACTIVE bindings past their expiry
    pub async fn expired_active_bindings(&self, now: DateTime<Utc>) -> Vec<Binding> {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| b.state == BindingState::Active && b.expires_at < now)
            .cloned()
            .collect()
    }

    /// Every binding row created at or after `since`, retired included;
    /// feeds the rebind-churn sweep
    pub async fn bindings_created_since(&self, since: DateTime<Utc>) -> Vec<Binding> {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| b.created_at >= since)
            .cloned()
            .collect()
    }

    // ---- ledger ----

    pub async fn append_ledger(&self, entry: LedgerEntry) {
        self.ledger.write().await.push(entry);
    }

    pub async fn update_ledger<F>(&self, id: &str, f: F) -> Option<LedgerEntry>
    where
        F: FnOnce(&mut LedgerEntry),
    {
        let mut ledger = self.ledger.write().await;
        let entry = ledger.iter_mut().find(|e| e.id == id)?;
        f(entry);
        Some(entry.clone())
    }

    pub async fn ledger_for_session(&self, session_id: &str) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    /// APPLIED portal-redirect rows for one MAC, session-scoped or not
    pub async fn applied_portal_rows(&self, mac: MacAddr) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| {
                e.mac == mac
                    && e.kind == RuleKind::PortalRedirect
                    && e.state == LedgerState::Applied
            })
            .cloned()
            .collect()
    }

    pub async fn ledger_in_state(&self, state: LedgerState) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    pub async fn all_ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.read().await.clone()
    }

    // ---- devices ----

    /// Upsert the device row for a MAC, refreshing `last_seen`
    pub async fn touch_device(&self, mac: MacAddr) -> Device {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let device = devices.entry(mac).or_insert_with(|| Device {
            mac,
            first_seen: now,
            last_seen: now,
            blocked: false,
            block_reason: None,
        });
        device.last_seen = now;
        device.clone()
    }

    pub async fn get_device(&self, mac: MacAddr) -> Option<Device> {
        self.devices.read().await.get(&mac).cloned()
    }

    pub async fn set_device_blocked(
        &self,
        mac: MacAddr,
        blocked: bool,
        reason: Option<String>,
    ) -> Device {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let device = devices.entry(mac).or_insert_with(|| Device {
            mac,
            first_seen: now,
            last_seen: now,
            blocked: false,
            block_reason: None,
        });
        device.blocked = blocked;
        device.block_reason = if blocked { reason } else { None };
        device.clone()
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RevokeReason;

    fn mac() -> MacAddr {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn session(id: &str, state: SessionState) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            mac: mac(),
            ip: Ipv4Addr::new(192, 168, 4, 10),
            auth_method: "voucher".to_string(),
            state,
            started_at: now,
            expires_at: now + chrono::Duration::seconds(3600),
            updated_at: now,
            terminated_at: None,
            revoke_reason: None,
        }
    }

    #[tokio::test]
    async fn test_session_round_trip_and_update() {
        let store = MemoryStore::new();
        store.insert_session(session("s1", SessionState::Pending)).await;

        let updated = store
            .update_session("s1", |s| {
                s.state = SessionState::Active;
            })
            .await
            .unwrap();
        assert_eq!(updated.state, SessionState::Active);

        let found = store.active_session_by_mac(mac()).await.unwrap();
        assert_eq!(found.id, "s1");
    }

    #[tokio::test]
    async fn test_expired_sweep_only_sees_active() {
        let store = MemoryStore::new();
        let mut expired = session("s1", SessionState::Active);
        expired.expires_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert_session(expired).await;

        let mut terminated = session("s2", SessionState::Terminated);
        terminated.expires_at = Utc::now() - chrono::Duration::seconds(60);
        terminated.revoke_reason = Some(RevokeReason::UserLogout);
        store.insert_session(terminated).await;

        let swept = store.expired_active_sessions(Utc::now()).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, "s1");
    }

    #[tokio::test]
    async fn test_mac_lock_serializes() {
        let store = Arc::new(MemoryStore::new());

        let guard = store.lock_mac(mac()).await;
        let store2 = store.clone();
        let contender = tokio::spawn(async move {
            let _g = store2.lock_mac(mac()).await;
        });

        // Give the contender a chance to run; it must stay blocked.
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_device_block_round_trip() {
        let store = MemoryStore::new();
        store.touch_device(mac()).await;

        let blocked = store
            .set_device_blocked(mac(), true, Some("abuse".to_string()))
            .await;
        assert!(blocked.blocked);
        assert_eq!(blocked.block_reason.as_deref(), Some("abuse"));

        let unblocked = store.set_device_blocked(mac(), false, None).await;
        assert!(!unblocked.blocked);
        assert!(unblocked.block_reason.is_none());
    }
}
