use std::fmt::Write as _;

use tracing::info;

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::firewall::RuleSet;
use crate::host::Host;
use crate::nginx::{self, Apply};
use crate::reconcile::{self, Outcome, Plan};

/// One-time preparation of a fresh Ubuntu host: packages,
/// firewall, service account, directories, the Nginx site (plain
/// HTTP until a certificate exists), log rotation, and a
/// monitoring helper.
///
/// Every step checks the host first, so re-running on a
/// bootstrapped host leaves it untouched (apart from the package
/// index refresh).
pub struct Bootstrap<'a> {
    config: &'a Config,
    upgrade: bool,
}

impl<'a> Bootstrap<'a> {
    #[must_use]
    pub const fn new(config: &'a Config) -> Self {
        Self {
            config,
            upgrade: true,
        }
    }

    /// Whether to run `apt-get upgrade` (default: yes).
    #[must_use]
    pub const fn upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    #[must_use]
    pub fn plan(&self) -> Plan<'_> {
        let config = self.config;
        let upgrade = self.upgrade;

        Plan::new()
            .step("require-root", reconcile::require_root)
            .step("apt-update", move |host| apt_update(host, upgrade))
            .step("packages", move |host| install_packages(host, &config.packages))
            .step("firewall", move |host| RuleSet::from_config(config).apply(host))
            .step("app-user", move |host| ensure_user(host, &config.user))
            .step("app-dirs", move |host| app_dirs(host, config))
            .step("nginx-site", move |host| {
                nginx::apply(host, config, &nginx::current_site(host, config)?, Apply::Restart)
            })
            .step("logrotate", move |host| {
                reconcile::ensure_file(
                    host,
                    &config.logrotate_path(),
                    &render_logrotate(config),
                    0o644,
                )
            })
            .step("monitor-script", move |host| {
                let path = config.monitor_path();
                let outcome =
                    reconcile::ensure_file(host, &path, &render_monitor(config), 0o755)?;
                if outcome.changed() {
                    let owner = format!("{0}:{0}", config.user);
                    host.run("chown", &[&owner, &path])?;
                }
                Ok(outcome)
            })
    }

    pub fn run(&self, host: &dyn Host) -> DeployResult<reconcile::Report> {
        info!("bootstrapping {}", host.name());
        let report = self.plan().run(host)?;

        info!("bootstrap complete ({} steps changed the host)", report.changed());
        info!("next: copy the application to {} and run `hoist deploy`", self.config.app_dir());
        Ok(report)
    }
}

const NONINTERACTIVE: &str = "DEBIAN_FRONTEND=noninteractive";

fn apt_update(host: &dyn Host, upgrade: bool) -> DeployResult<Outcome> {
    host.run("env", &[NONINTERACTIVE, "apt-get", "update", "-q"])?;
    if upgrade {
        host.run(
            "env",
            &[
                NONINTERACTIVE,
                "apt-get",
                "upgrade",
                "-y",
                "-q",
                "-o",
                "Dpkg::Options::=--force-confold",
            ],
        )?;
    }
    Ok(Outcome::Unchanged)
}

/// Install whatever in `packages` dpkg does not report as
/// installed.
pub fn install_packages(host: &dyn Host, packages: &[String]) -> DeployResult<Outcome> {
    let mut missing = Vec::new();
    for package in packages {
        let status = host.run("dpkg-query", &["-W", "-f=${Status}", package]);
        let installed = match status {
            Ok(s) => s.trim().ends_with("install ok installed"),
            Err(DeployError::CommandFailed { .. }) => false,
            Err(e) => return Err(e),
        };
        if !installed {
            missing.push(package.as_str());
        }
    }

    if missing.is_empty() {
        return Ok(Outcome::Unchanged);
    }

    info!("installing {}", missing.join(" "));
    let mut args = vec![NONINTERACTIVE, "apt-get", "install", "-y", "-q"];
    args.extend(missing);
    host.run("env", &args)?;
    Ok(Outcome::Changed)
}

/// Create the service account with a home directory.
pub fn ensure_user(host: &dyn Host, user: &str) -> DeployResult<Outcome> {
    if host.succeeds("id", &[user])? {
        return Ok(Outcome::Unchanged);
    }
    info!("creating user {user}");
    host.run("useradd", &["--create-home", "--shell", "/bin/bash", user])?;
    Ok(Outcome::Changed)
}

fn app_dirs(host: &dyn Host, config: &Config) -> DeployResult<Outcome> {
    let user = Some(config.user.as_str());
    Ok(reconcile::ensure_dir(host, &config.app_dir(), user)?
        .and(reconcile::ensure_dir(host, &config.logs_dir(), user)?)
        .and(reconcile::ensure_dir(host, &config.webroot, None)?))
}

/// Daily rotation of the app's own log files.
#[must_use]
pub fn render_logrotate(config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}/*.log {{", config.logs_dir());
    out.push_str("    daily\n");
    out.push_str("    rotate 14\n");
    out.push_str("    compress\n");
    out.push_str("    delaycompress\n");
    out.push_str("    missingok\n");
    out.push_str("    notifempty\n");
    out.push_str("    copytruncate\n");
    let _ = writeln!(out, "    su {0} {0}", config.user);
    let _ = writeln!(out, "    create 0640 {0} {0}", config.user);
    out.push_str("}\n");
    out
}

/// Shell helper printing a quick health summary of the host.
#[must_use]
pub fn render_monitor(config: &Config) -> String {
    let service = &config.service;
    let health = format!("http://{}{}", config.upstream(), config.health_path);
    format!(
        "#!/usr/bin/env bash
# Managed by hoist. Quick health summary for {service}.
set -u

echo \"=== {service} ===\"
systemctl --no-pager --lines=0 status {service} || true
echo
echo \"=== nginx ===\"
systemctl is-active nginx || true
echo
echo \"=== health ===\"
curl -s -o /dev/null -w '%{{http_code}}\\n' --max-time 5 {health} || echo unreachable
echo
echo \"=== disk ===\"
df -h /
echo
echo \"=== memory ===\"
free -h
echo
echo \"=== recent logs ===\"
journalctl -u {service} -n 20 --no-pager
"
    )
}
