use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::host::Host;
use crate::reconcile::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// One inbound allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rule {
    pub port: u16,
    pub protocol: Protocol,
}

impl Rule {
    #[must_use]
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for Rule {
    type Err = DeployError;

    /// Parses `22/tcp`, `53/udp`, or a bare port (tcp).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s.split_once('/').unwrap_or((s, "tcp"));
        let port = port
            .parse()
            .map_err(|_| DeployError::Other(format!("bad firewall rule: {s}")))?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(DeployError::Other(format!("bad firewall rule: {s}"))),
        };
        Ok(Self { port, protocol })
    }
}

/// Default-deny inbound policy plus an ordered allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub allow: Vec<Rule>,
}

/// What `ufw` currently enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UfwState {
    pub active: bool,
    pub default_incoming: Option<String>,
    pub default_outgoing: Option<String>,
    pub rules: BTreeSet<Rule>,
}

impl UfwState {
    /// Combine `ufw status verbose` (activity and defaults) with
    /// `ufw show added` (rules, listed even while inactive).
    #[must_use]
    pub fn parse(status: &str, added: &str) -> Self {
        let mut state = Self::default();

        for line in status.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Status:") {
                state.active = rest.trim() == "active";
            } else if let Some(rest) = line.strip_prefix("Default:") {
                for part in rest.split(',') {
                    let part = part.trim();
                    if let Some(policy) = part.strip_suffix("(incoming)") {
                        state.default_incoming = Some(policy.trim().to_string());
                    } else if let Some(policy) = part.strip_suffix("(outgoing)") {
                        state.default_outgoing = Some(policy.trim().to_string());
                    }
                }
            }
        }

        for line in added.lines() {
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("ufw") || tokens.next() != Some("allow") {
                continue;
            }
            if let Some(Ok(rule)) = tokens.next().map(str::parse::<Rule>) {
                state.rules.insert(rule);
            }
        }

        state
    }
}

impl RuleSet {
    /// SSH, HTTP, HTTPS, and the operational override port.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut allow = vec![Rule::tcp(22), Rule::tcp(80), Rule::tcp(443)];
        let ops = Rule::tcp(config.ops_port);
        if !allow.contains(&ops) {
            allow.push(ops);
        }
        Self { allow }
    }

    /// `ufw` invocations that move `state` to this rule set.
    /// Empty when the firewall already matches.
    #[must_use]
    pub fn plan(&self, state: &UfwState) -> Vec<Vec<String>> {
        let mut cmds = Vec::new();
        let owned = |args: &[&str]| args.iter().map(ToString::to_string).collect::<Vec<_>>();

        if state.default_incoming.as_deref() != Some("deny") {
            cmds.push(owned(&["default", "deny", "incoming"]));
        }
        if state.default_outgoing.as_deref() != Some("allow") {
            cmds.push(owned(&["default", "allow", "outgoing"]));
        }
        for rule in &self.allow {
            if !state.rules.contains(rule) {
                cmds.push(vec!["allow".to_string(), rule.to_string()]);
            }
        }
        if !state.active {
            cmds.push(owned(&["--force", "enable"]));
        }

        cmds
    }

    /// Bring the host firewall in line with this rule set.
    pub fn apply(&self, host: &dyn Host) -> DeployResult<Outcome> {
        let status = host.run("ufw", &["status", "verbose"])?;
        let added = host.run("ufw", &["show", "added"])?;
        let state = UfwState::parse(&status, &added);

        let plan = self.plan(&state);
        if plan.is_empty() {
            return Ok(Outcome::Unchanged);
        }
        for args in &plan {
            info!("ufw {}", args.join(" "));
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            host.run("ufw", &refs)?;
        }
        Ok(Outcome::Changed)
    }
}
