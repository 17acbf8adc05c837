//! iptables rules for the VM's NAT path
//!
//! Rules are installed with check-then-append (`-C` before `-A`), so applying
//! the same rule set twice leaves the tables unchanged.

use std::fmt;

use crate::error::Result;
use crate::exec::{run_checked, run_succeeds, CommandRunner};

const IPTABLES: &str = "iptables";

/// A single iptables rule: table, chain and match/target arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

/// What `ensure` did with a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    AlreadyPresent,
    Appended,
}

impl FirewallRule {
    pub fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn args<'a>(&'a self, action: &'a str) -> Vec<&'a str> {
        let mut args = vec!["-t", self.table, action, self.chain];
        args.extend(self.spec.iter().map(String::as_str));
        args
    }

    /// Append the rule unless an identical one already exists
    pub fn ensure(&self, runner: &dyn CommandRunner) -> Result<RuleOutcome> {
        if run_succeeds(runner, IPTABLES, &self.args("-C")) {
            return Ok(RuleOutcome::AlreadyPresent);
        }
        run_checked(runner, IPTABLES, &self.args("-A"))?;
        Ok(RuleOutcome::Appended)
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table,
            self.chain,
            self.spec.join(" ")
        )
    }
}

/// Masquerade and forwarding rules between the TAP device and the uplink
pub fn nat_rules(subnet: &str, tap: &str, uplink: &str) -> Vec<FirewallRule> {
    vec![
        FirewallRule::new(
            "nat",
            "POSTROUTING",
            &["-s", subnet, "-o", uplink, "-j", "MASQUERADE"],
        ),
        FirewallRule::new(
            "filter",
            "FORWARD",
            &["-i", tap, "-o", uplink, "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            "filter",
            "FORWARD",
            &[
                "-i",
                uplink,
                "-o",
                tap,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ),
    ]
}

/// Host input/output acceptance scoped to the TAP device
pub fn tap_rules(tap: &str) -> Vec<FirewallRule> {
    vec![
        FirewallRule::new("filter", "INPUT", &["-i", tap, "-j", "ACCEPT"]),
        FirewallRule::new("filter", "OUTPUT", &["-o", tap, "-j", "ACCEPT"]),
    ]
}

/// Extract the device of the first default route from `ip route show default`
pub fn parse_default_route_device(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "dev")?;
            tokens.next().map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let out = "default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600\n";
        assert_eq!(parse_default_route_device(out).as_deref(), Some("wlp3s0"));
    }

    #[test]
    fn test_parse_default_route_picks_first() {
        let out = "default via 10.0.0.1 dev eth0 metric 100\n\
                   default via 10.1.0.1 dev eth1 metric 200\n";
        assert_eq!(parse_default_route_device(out).as_deref(), Some("eth0"));
    }

    #[test]
    fn test_parse_default_route_missing() {
        assert_eq!(parse_default_route_device(""), None);
        assert_eq!(
            parse_default_route_device("10.0.0.0/8 dev eth0 scope link\n"),
            None
        );
    }

    #[test]
    fn test_rule_args() {
        let rule = &nat_rules("172.16.0.0/24", "tap0", "eth0")[0];
        assert_eq!(
            rule.args("-C"),
            vec![
                "-t",
                "nat",
                "-C",
                "POSTROUTING",
                "-s",
                "172.16.0.0/24",
                "-o",
                "eth0",
                "-j",
                "MASQUERADE"
            ]
        );
        assert_eq!(
            rule.to_string(),
            "-t nat POSTROUTING -s 172.16.0.0/24 -o eth0 -j MASQUERADE"
        );
    }

    #[test]
    fn test_tap_rules_scoped_to_tap() {
        let rules = tap_rules("tap7");
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.spec.contains(&"tap7".to_string())));
    }
}
