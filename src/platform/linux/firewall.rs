use std::fs;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Sysctl toggled so the host routes namespace traffic to its uplink.
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// What a rule does with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Source-NAT behind the host's outbound address.
    Masquerade,
    /// Accept forwarded traffic.
    Forward,
}

/// One NAT or forwarding rule. Immutable; [`FirewallRule::apply`] appends
/// exactly one rule to the host's packet-filter configuration.
#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub table: String,
    pub chain: String,
    pub kind: RuleKind,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub source: Option<String>,
    pub dest: Option<String>,
}

impl FirewallRule {
    /// NAT everything leaving the given source network.
    pub fn masquerade(source: &str) -> Self {
        Self {
            table: "nat".into(),
            chain: "POSTROUTING".into(),
            kind: RuleKind::Masquerade,
            in_iface: None,
            out_iface: None,
            source: Some(source.into()),
            dest: None,
        }
    }

    /// Accept traffic forwarded in from the given interface.
    pub fn forward_from(iface: &str) -> Self {
        Self {
            table: "filter".into(),
            chain: "FORWARD".into(),
            kind: RuleKind::Forward,
            in_iface: Some(iface.into()),
            out_iface: None,
            source: None,
            dest: None,
        }
    }

    /// Accept traffic forwarded out through the given interface.
    pub fn forward_to(iface: &str) -> Self {
        Self {
            table: "filter".into(),
            chain: "FORWARD".into(),
            kind: RuleKind::Forward,
            in_iface: None,
            out_iface: Some(iface.into()),
            source: None,
            dest: None,
        }
    }

    /// Render the iptables invocation for this rule.
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.clone(),
            "-A".to_string(),
            self.chain.clone(),
        ];
        if let Some(source) = &self.source {
            args.push("-s".to_string());
            args.push(source.clone());
        }
        if let Some(dest) = &self.dest {
            args.push("-d".to_string());
            args.push(dest.clone());
        }
        if let Some(iface) = &self.in_iface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        if let Some(iface) = &self.out_iface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }
        args.push("-j".to_string());
        args.push(
            match self.kind {
                RuleKind::Masquerade => "MASQUERADE",
                RuleKind::Forward => "ACCEPT",
            }
            .to_string(),
        );
        args
    }

    /// Append this rule on the host.
    pub fn apply(&self) -> Result<()> {
        let output = Command::new("iptables")
            .args(self.to_args())
            .output()
            .context("failed to execute iptables")?;

        if !output.status.success() {
            bail!(
                "iptables rejected the rule: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Allow the host to route between the veth and its uplink.
pub fn enable_ipv4_forwarding() -> Result<()> {
    fs::write(IP_FORWARD, "1").with_context(|| format!("failed to write {IP_FORWARD}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_rule_renders_source_nat() {
        let rule = FirewallRule::masquerade("10.0.0.0/24");
        assert_eq!(
            rule.to_args(),
            vec!["-t", "nat", "-A", "POSTROUTING", "-s", "10.0.0.0/24", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn forward_rules_render_one_interface_each() {
        assert_eq!(
            FirewallRule::forward_from("veth0").to_args(),
            vec!["-t", "filter", "-A", "FORWARD", "-i", "veth0", "-j", "ACCEPT"]
        );
        assert_eq!(
            FirewallRule::forward_to("veth0").to_args(),
            vec!["-t", "filter", "-A", "FORWARD", "-o", "veth0", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn destination_match_is_rendered_when_set() {
        let mut rule = FirewallRule::masquerade("10.0.0.0/24");
        rule.dest = Some("192.168.1.0/24".into());
        let args = rule.to_args();
        let d = args.iter().position(|a| a == "-d").unwrap();
        assert_eq!(args[d + 1], "192.168.1.0/24");
    }
}
