//! Host rule backend
//!
//! Renders abstract rules to iptables (L3) and ebtables (L2) invocations
//! and executes them as subprocesses. The two tools are process-global on
//! the host, so every invocation serializes behind one backend mutex.

use crate::enforcer::{
    ApplyOutcome, ApplyResult, Enforcer, InstalledRule, RetractOutcome, RuleHandle,
};
use crate::mac::MacAddr;
use crate::rules::{RenderedRule, RuleBackend, RuleSet};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Enforcer that mutates the host packet-filter tables
pub struct ShellEnforcer {
    iptables_bin: String,
    ebtables_bin: String,
    /// Serializes subprocess invocations; iptables is single-writer
    cmd_lock: Mutex<()>,
    installed: Mutex<Vec<InstalledRule>>,
    /// Rendered form per handle id, for delete-command reconstruction
    rendered: Mutex<HashMap<String, RenderedRule>>,
}

impl ShellEnforcer {
    pub fn new() -> Self {
        Self {
            iptables_bin: "iptables".to_string(),
            ebtables_bin: "ebtables".to_string(),
            cmd_lock: Mutex::new(()),
            installed: Mutex::new(Vec::new()),
            rendered: Mutex::new(HashMap::new()),
        }
    }

    fn binary(&self, backend: RuleBackend) -> &str {
        match backend {
            RuleBackend::L3 => &self.iptables_bin,
            RuleBackend::L2 => &self.ebtables_bin,
        }
    }

    /// Build the full argument vector for one rule operation
    fn command_args(rule: &RenderedRule, op: RuleOp) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(table) = &rule.table {
            args.push("-t".to_string());
            args.push(table.clone());
        }
        match op {
            RuleOp::Append => {
                args.push("-A".to_string());
                args.push(rule.chain.clone());
            }
            RuleOp::Insert(pos) => {
                args.push("-I".to_string());
                args.push(rule.chain.clone());
                args.push(pos.to_string());
            }
            RuleOp::Delete => {
                args.push("-D".to_string());
                args.push(rule.chain.clone());
            }
        }
        args.extend(rule.spec.iter().cloned());
        args
    }

    /// Run one backend command; the caller holds the command lock
    async fn run(&self, backend: RuleBackend, args: &[String]) -> CommandResult {
        let binary = self.binary(backend);
        debug!(binary = %binary, args = ?args, "rule backend invocation");

        let output = match Command::new(binary).args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                return CommandResult::SpawnError(format!("failed to execute {binary}: {e}"))
            }
        };

        if output.status.success() {
            CommandResult::Ok
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            CommandResult::Rejected(stderr)
        }
    }

    async fn resolve_rendered(&self, handle: &RuleHandle) -> Option<RenderedRule> {
        if let Some(rule) = self.rendered.lock().await.get(&handle.id) {
            return Some(rule.clone());
        }
        // Handle from a previous process life; rebuild from its spec.
        RenderedRule::from_text(&handle.spec)
    }
}

impl Default for ShellEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum RuleOp {
    Append,
    Insert(usize),
    Delete,
}

enum CommandResult {
    Ok,
    /// Nonzero exit; the backend parsed and refused the rule
    Rejected(String),
    /// The subprocess could not run at all
    SpawnError(String),
}

#[async_trait]
impl Enforcer for ShellEnforcer {
    async fn apply(&self, rules: &RuleSet) -> ApplyOutcome {
        let _guard = self.cmd_lock.lock().await;

        let now = Utc::now();
        let mut handles = Vec::new();
        let mut head_position = 1usize;

        for rendered in rules.render() {
            let op = if rendered.insert_at_head {
                let op = RuleOp::Insert(head_position);
                head_position += 1;
                op
            } else {
                RuleOp::Append
            };

            let args = Self::command_args(&rendered, op);
            match self.run(rendered.backend, &args).await {
                CommandResult::Ok => {
                    let handle = RuleHandle {
                        id: Uuid::new_v4().to_string(),
                        backend: rendered.backend,
                        spec: rendered.text(),
                    };
                    self.rendered
                        .lock()
                        .await
                        .insert(handle.id.clone(), rendered.clone());
                    self.installed.lock().await.push(InstalledRule {
                        handle: handle.clone(),
                        kind: rules.kind,
                        mac: rules.mac,
                        installed_at: now,
                    });
                    handles.push(handle);
                }
                CommandResult::Rejected(stderr) => {
                    warn!(
                        kind = rules.kind.as_str(),
                        rule = %rendered.text(),
                        stderr = %stderr,
                        "rule backend rejected rule"
                    );
                    let result = if handles.is_empty() {
                        ApplyResult::Failed
                    } else {
                        ApplyResult::Partial
                    };
                    return ApplyOutcome {
                        handles,
                        result,
                        diagnostics: vec![format!("{}: {stderr}", rendered.text())],
                        permanent: true,
                    };
                }
                CommandResult::SpawnError(detail) => {
                    warn!(kind = rules.kind.as_str(), detail = %detail, "rule backend unavailable");
                    let result = if handles.is_empty() {
                        ApplyResult::Failed
                    } else {
                        ApplyResult::Partial
                    };
                    return ApplyOutcome {
                        handles,
                        result,
                        diagnostics: vec![detail],
                        permanent: false,
                    };
                }
            }
        }

        ApplyOutcome::ok(handles)
    }

    async fn retract(&self, handles: &[RuleHandle]) -> RetractOutcome {
        let _guard = self.cmd_lock.lock().await;

        let mut outcome = RetractOutcome::default();

        for handle in handles {
            let known = {
                let installed = self.installed.lock().await;
                installed.iter().any(|r| r.handle.id == handle.id)
            };

            let Some(rendered) = self.resolve_rendered(handle).await else {
                outcome.still_present.push(handle.clone());
                continue;
            };

            let args = Self::command_args(&rendered, RuleOp::Delete);
            match self.run(rendered.backend, &args).await {
                CommandResult::Ok => {
                    let mut installed = self.installed.lock().await;
                    installed.retain(|r| r.handle.id != handle.id);
                    self.rendered.lock().await.remove(&handle.id);
                    outcome.retracted.push(handle.clone());
                }
                CommandResult::Rejected(stderr) => {
                    // Delete of an absent rule is the common idempotent
                    // case; anything else means the rule is stuck.
                    let absent = stderr.contains("does not exist")
                        || stderr.contains("No chain/target/match")
                        || stderr.contains("o matching rule");
                    if absent || !known {
                        let mut installed = self.installed.lock().await;
                        installed.retain(|r| r.handle.id != handle.id);
                        self.rendered.lock().await.remove(&handle.id);
                        outcome.missing.push(handle.clone());
                    } else {
                        warn!(handle = %handle.id, stderr = %stderr, "rule retract refused");
                        outcome.still_present.push(handle.clone());
                    }
                }
                CommandResult::SpawnError(detail) => {
                    warn!(handle = %handle.id, detail = %detail, "rule backend unavailable");
                    outcome.still_present.push(handle.clone());
                }
            }
        }

        outcome
    }

    async fn snapshot(&self) -> Vec<InstalledRule> {
        self.installed.lock().await.clone()
    }
}

/// Best-effort neighbor-table lookup for the gateway hardware address,
/// used at startup when configuration leaves it blank
pub async fn discover_gateway_mac(gateway_ip: Ipv4Addr) -> Option<MacAddr> {
    let output = Command::new("ip")
        .args(["neigh", "show", &gateway_ip.to_string()])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut tokens = stdout.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "lladdr" {
            if let Some(mac) = tokens.next() {
                return mac.parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleParams;

    fn rendered() -> RenderedRule {
        let params = RuleParams {
            lan: "wlan0".to_string(),
            wan: "eth0".to_string(),
            portal_ip: Ipv4Addr::new(192, 168, 4, 1),
            portal_port: 8080,
            gateway_ip: Ipv4Addr::new(192, 168, 4, 1),
            gateway_mac: RuleParams::placeholder_gateway_mac(),
            redirect_https: false,
        };
        crate::rules::portal_redirect("aa:bb:cc:dd:ee:01".parse().unwrap(), &params)
            .render()
            .remove(0)
    }

    #[test]
    fn test_append_args_include_table() {
        let args = ShellEnforcer::command_args(&rendered(), RuleOp::Append);
        assert_eq!(&args[..4], &["-t", "nat", "-A", "PREROUTING"]);
    }

    #[test]
    fn test_insert_args_carry_position() {
        let args = ShellEnforcer::command_args(&rendered(), RuleOp::Insert(2));
        assert!(args.windows(3).any(|w| w == ["-I", "PREROUTING", "2"]));
    }

    #[test]
    fn test_delete_args_mirror_append() {
        let append = ShellEnforcer::command_args(&rendered(), RuleOp::Append);
        let delete = ShellEnforcer::command_args(&rendered(), RuleOp::Delete);
        assert_eq!(append.len(), delete.len());
        assert!(delete.contains(&"-D".to_string()));
        assert_eq!(append.last(), delete.last());
    }
}
