//! Abstract packet-filter rule model and per-client synthesis
//!
//! All enforcement is expressed through five rule kinds. Rule sets are
//! backend-agnostic bundles; rendering to concrete iptables/ebtables
//! argument vectors happens here so both the active backend and the
//! ledger descriptors agree on one canonical form.

use crate::config::EngineConfig;
use crate::mac::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Which rule plane a rule lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleBackend {
    L3,
    L2,
}

impl RuleBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleBackend::L3 => "L3",
            RuleBackend::L2 => "L2",
        }
    }
}

/// The five abstract rule kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    /// Steer unauthenticated HTTP(S) to the portal; deny other forward
    /// traffic except DNS and DHCP
    PortalRedirect,
    /// Permit forward egress for an authenticated (MAC, IP)
    GrantEgress,
    /// Drop L3 frames whose source IP does not match the binding
    BindGuard,
    /// Drop L2 frames to anything but the gateway or broadcast/multicast
    IsolateL2,
    /// Drop ARP that asserts an identity other than the client's or the
    /// gateway's
    ArpGuard,
}

impl RuleKind {
    pub fn backend(&self) -> RuleBackend {
        match self {
            RuleKind::PortalRedirect | RuleKind::GrantEgress | RuleKind::BindGuard => {
                RuleBackend::L3
            }
            RuleKind::IsolateL2 | RuleKind::ArpGuard => RuleBackend::L2,
        }
    }

    /// Match order within a chain: lower is matched earlier. Guards must
    /// sit ahead of egress so spoofed packets drop before forwarding.
    pub fn match_priority(&self) -> u8 {
        match self {
            RuleKind::BindGuard => 0,
            RuleKind::ArpGuard => 1,
            RuleKind::IsolateL2 => 2,
            RuleKind::PortalRedirect => 3,
            RuleKind::GrantEgress => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::PortalRedirect => "PORTAL_REDIRECT",
            RuleKind::GrantEgress => "GRANT_EGRESS",
            RuleKind::BindGuard => "BIND_GUARD",
            RuleKind::IsolateL2 => "ISOLATE_L2",
            RuleKind::ArpGuard => "ARP_GUARD",
        }
    }
}

/// Network parameters a rule set is rendered against, snapshotted from
/// configuration at synthesis time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleParams {
    pub lan: String,
    pub wan: String,
    pub portal_ip: Ipv4Addr,
    pub portal_port: u16,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddr,
    pub redirect_https: bool,
}

impl RuleParams {
    /// Stand-in gateway MAC for simulation when none is configured and
    /// discovery has not run
    pub fn placeholder_gateway_mac() -> MacAddr {
        MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            lan: config.interfaces.lan.clone(),
            wan: config.interfaces.wan.clone(),
            portal_ip: config.network.portal_ip,
            portal_port: config.network.portal_port,
            gateway_ip: config.network.gateway_ip,
            gateway_mac: config
                .network
                .gateway_mac
                .unwrap_or_else(Self::placeholder_gateway_mac),
            redirect_https: config.network.redirect_https,
        }
    }
}

/// A backend-agnostic rule bundle for one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub kind: RuleKind,
    pub mac: MacAddr,
    pub ip: Option<Ipv4Addr>,
    pub params: RuleParams,
}

/// One concrete rule in canonical append form. The active backend turns
/// `spec` into `-A/-I/-D chain ...` invocations; the simulator records
/// it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedRule {
    pub backend: RuleBackend,
    /// iptables table (`nat`); `None` means the filter table
    pub table: Option<String>,
    pub chain: String,
    pub spec: Vec<String>,
    /// Insert at chain head instead of appending
    pub insert_at_head: bool,
}

impl RenderedRule {
    fn l3(table: Option<&str>, chain: &str, spec: &[&str], insert_at_head: bool) -> Self {
        Self {
            backend: RuleBackend::L3,
            table: table.map(str::to_string),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
            insert_at_head,
        }
    }

    fn l2(chain: &str, spec: &[&str]) -> Self {
        Self {
            backend: RuleBackend::L2,
            table: None,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
            insert_at_head: false,
        }
    }

    /// Canonical text form used for handle specs, diagnostics, and
    /// ledger summaries
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        match self.backend {
            RuleBackend::L3 => parts.push("iptables".to_string()),
            RuleBackend::L2 => parts.push("ebtables".to_string()),
        }
        if let Some(table) = &self.table {
            parts.push("-t".to_string());
            parts.push(table.clone());
        }
        parts.push(self.chain.clone());
        parts.extend(self.spec.iter().cloned());
        parts.join(" ")
    }

    /// Parse the canonical text form back. Used by the shell backend to
    /// rebuild delete commands for handles that survived a restart.
    pub fn from_text(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace().map(str::to_string);
        let backend = match tokens.next()?.as_str() {
            "iptables" => RuleBackend::L3,
            "ebtables" => RuleBackend::L2,
            _ => return None,
        };
        let mut next = tokens.next()?;
        let mut table = None;
        if next == "-t" {
            table = Some(tokens.next()?);
            next = tokens.next()?;
        }
        let chain = next;
        let spec: Vec<String> = tokens.collect();
        if spec.is_empty() {
            return None;
        }
        Some(Self {
            backend,
            table,
            chain,
            spec,
            insert_at_head: false,
        })
    }
}

impl RuleSet {
    pub fn backend(&self) -> RuleBackend {
        self.kind.backend()
    }

    /// Expand into concrete rules, in match order
    pub fn render(&self) -> Vec<RenderedRule> {
        let mac = self.mac.to_string();
        let params = &self.params;

        match self.kind {
            RuleKind::PortalRedirect => {
                let portal = format!("{}:{}", params.portal_ip, params.portal_port);
                let mut rules = vec![RenderedRule::l3(
                    Some("nat"),
                    "PREROUTING",
                    &[
                        "-i", &params.lan, "-p", "tcp", "--dport", "80", "-m", "mac",
                        "--mac-source", &mac, "-j", "DNAT", "--to-destination", &portal,
                    ],
                    false,
                )];
                if params.redirect_https {
                    rules.push(RenderedRule::l3(
                        Some("nat"),
                        "PREROUTING",
                        &[
                            "-i", &params.lan, "-p", "tcp", "--dport", "443", "-m", "mac",
                            "--mac-source", &mac, "-j", "DNAT", "--to-destination", &portal,
                        ],
                        false,
                    ));
                }
                // DNS and DHCP stay reachable for unauthenticated clients
                rules.push(RenderedRule::l3(
                    None,
                    "FORWARD",
                    &[
                        "-i", &params.lan, "-m", "mac", "--mac-source", &mac, "-p", "udp",
                        "--dport", "53", "-j", "ACCEPT",
                    ],
                    false,
                ));
                rules.push(RenderedRule::l3(
                    None,
                    "FORWARD",
                    &[
                        "-i", &params.lan, "-m", "mac", "--mac-source", &mac, "-p", "tcp",
                        "--dport", "53", "-j", "ACCEPT",
                    ],
                    false,
                ));
                rules.push(RenderedRule::l3(
                    None,
                    "FORWARD",
                    &[
                        "-i", &params.lan, "-m", "mac", "--mac-source", &mac, "-p", "udp",
                        "--dport", "67:68", "-j", "ACCEPT",
                    ],
                    false,
                ));
                rules.push(RenderedRule::l3(
                    None,
                    "FORWARD",
                    &["-i", &params.lan, "-m", "mac", "--mac-source", &mac, "-j", "DROP"],
                    false,
                ));
                rules
            }

            RuleKind::GrantEgress => {
                let ip = self.expect_ip();
                vec![
                    RenderedRule::l3(
                        None,
                        "FORWARD",
                        &[
                            "-i", &params.lan, "-o", &params.wan, "-m", "mac", "--mac-source",
                            &mac, "-s", &ip, "-j", "ACCEPT",
                        ],
                        false,
                    ),
                    RenderedRule::l3(
                        None,
                        "FORWARD",
                        &[
                            "-i", &params.wan, "-o", &params.lan, "-d", &ip, "-m", "state",
                            "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
                        ],
                        false,
                    ),
                ]
            }

            RuleKind::BindGuard => {
                let ip = self.expect_ip();
                vec![
                    RenderedRule::l3(
                        None,
                        "FORWARD",
                        &[
                            "-i", &params.lan, "-m", "mac", "--mac-source", &mac, "!", "-s",
                            &ip, "-j", "LOG", "--log-prefix", "bind-guard:",
                        ],
                        true,
                    ),
                    RenderedRule::l3(
                        None,
                        "FORWARD",
                        &[
                            "-i", &params.lan, "-m", "mac", "--mac-source", &mac, "!", "-s",
                            &ip, "-j", "DROP",
                        ],
                        true,
                    ),
                ]
            }

            RuleKind::IsolateL2 => {
                let gw = params.gateway_mac.to_string();
                vec![
                    RenderedRule::l2("FORWARD", &["-s", &mac, "-d", &gw, "-j", "ACCEPT"]),
                    RenderedRule::l2(
                        "FORWARD",
                        &["-s", &mac, "-d", "Broadcast", "-j", "ACCEPT"],
                    ),
                    RenderedRule::l2(
                        "FORWARD",
                        &["-s", &mac, "-d", "Multicast", "-j", "ACCEPT"],
                    ),
                    RenderedRule::l2("FORWARD", &["-s", &mac, "-j", "DROP"]),
                ]
            }

            RuleKind::ArpGuard => {
                let ip = self.expect_ip();
                vec![
                    RenderedRule::l2(
                        "FORWARD",
                        &[
                            "-p", "ARP", "-s", &mac, "--arp-ip-src", &ip, "--arp-mac-src",
                            &mac, "-j", "ACCEPT",
                        ],
                    ),
                    RenderedRule::l2("FORWARD", &["-p", "ARP", "-s", &mac, "-j", "DROP"]),
                ]
            }
        }
    }

    fn expect_ip(&self) -> String {
        // Synthesis always pairs an IP with the kinds that need one
        self.ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }
}

/// Portal steering for an unauthenticated MAC
pub fn portal_redirect(mac: MacAddr, params: &RuleParams) -> RuleSet {
    RuleSet {
        kind: RuleKind::PortalRedirect,
        mac,
        ip: None,
        params: params.clone(),
    }
}

/// The ordered rule sets applied on a successful grant. The declared
/// order matches the grant procedure; match ordering inside the chains
/// is the enforcer's job via `match_priority`.
pub fn grant_rules(mac: MacAddr, ip: Ipv4Addr, params: &RuleParams) -> Vec<RuleSet> {
    [
        RuleKind::GrantEgress,
        RuleKind::BindGuard,
        RuleKind::IsolateL2,
        RuleKind::ArpGuard,
    ]
    .into_iter()
    .map(|kind| RuleSet {
        kind,
        mac,
        ip: Some(ip),
        params: params.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RuleParams {
        RuleParams {
            lan: "wlan0".to_string(),
            wan: "eth0".to_string(),
            portal_ip: Ipv4Addr::new(192, 168, 4, 1),
            portal_port: 8080,
            gateway_ip: Ipv4Addr::new(192, 168, 4, 1),
            gateway_mac: "02:00:00:00:00:01".parse().unwrap(),
            redirect_https: true,
        }
    }

    fn mac() -> MacAddr {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    #[test]
    fn test_portal_redirect_covers_80_and_443() {
        let rules = portal_redirect(mac(), &params()).render();
        let nat_rules: Vec<_> = rules
            .iter()
            .filter(|r| r.table.as_deref() == Some("nat"))
            .collect();
        assert_eq!(nat_rules.len(), 2);
        assert!(nat_rules[0].spec.contains(&"80".to_string()));
        assert!(nat_rules[1].spec.contains(&"443".to_string()));
    }

    #[test]
    fn test_portal_redirect_https_optional() {
        let mut p = params();
        p.redirect_https = false;
        let rules = portal_redirect(mac(), &p).render();
        assert!(!rules
            .iter()
            .any(|r| r.spec.contains(&"443".to_string())));
    }

    #[test]
    fn test_portal_redirect_allows_dns_dhcp_then_drops() {
        let rules = portal_redirect(mac(), &params()).render();
        let forward: Vec<_> = rules.iter().filter(|r| r.chain == "FORWARD").collect();
        // udp 53, tcp 53, dhcp, default drop
        assert_eq!(forward.len(), 4);
        assert_eq!(forward.last().unwrap().spec.last().unwrap(), "DROP");
    }

    #[test]
    fn test_grant_rules_order_and_backends() {
        let sets = grant_rules(mac(), Ipv4Addr::new(192, 168, 4, 10), &params());
        let kinds: Vec<_> = sets.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RuleKind::GrantEgress,
                RuleKind::BindGuard,
                RuleKind::IsolateL2,
                RuleKind::ArpGuard
            ]
        );
        assert_eq!(sets[0].backend(), RuleBackend::L3);
        assert_eq!(sets[2].backend(), RuleBackend::L2);
    }

    #[test]
    fn test_guards_match_before_egress() {
        assert!(RuleKind::BindGuard.match_priority() < RuleKind::GrantEgress.match_priority());
        assert!(RuleKind::ArpGuard.match_priority() < RuleKind::GrantEgress.match_priority());
        assert!(RuleKind::IsolateL2.match_priority() < RuleKind::GrantEgress.match_priority());
    }

    #[test]
    fn test_bind_guard_inserts_at_head() {
        let sets = grant_rules(mac(), Ipv4Addr::new(192, 168, 4, 10), &params());
        let bind_guard = sets.iter().find(|s| s.kind == RuleKind::BindGuard).unwrap();
        assert!(bind_guard.render().iter().all(|r| r.insert_at_head));
    }

    #[test]
    fn test_rendered_text_is_readable() {
        let rules = portal_redirect(mac(), &params()).render();
        let text = rules[0].text();
        assert!(text.starts_with("iptables -t nat PREROUTING"));
        assert!(text.contains("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn test_rendered_text_round_trip() {
        for rendered in portal_redirect(mac(), &params()).render() {
            let back = RenderedRule::from_text(&rendered.text()).unwrap();
            assert_eq!(back.backend, rendered.backend);
            assert_eq!(back.table, rendered.table);
            assert_eq!(back.chain, rendered.chain);
            assert_eq!(back.spec, rendered.spec);
        }
    }

    #[test]
    fn test_rule_set_descriptor_round_trip() {
        let sets = grant_rules(mac(), Ipv4Addr::new(192, 168, 4, 10), &params());
        let value = serde_json::to_value(&sets[1]).unwrap();
        let back: RuleSet = serde_json::from_value(value).unwrap();
        assert_eq!(back, sets[1]);
    }
}
