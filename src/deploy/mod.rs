use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::firewall::RuleSet;
use crate::host::Host;
use crate::nginx::{self, Apply};
use crate::reconcile::{self, Outcome, Plan, Report};
use crate::systemd::{self, ServiceUnit};
use crate::tls;

/// Installs and runs the application on a bootstrapped host.
///
/// `deploy` (re)creates the runtime environment, service unit,
/// proxy site and firewall rules and restarts the service.
/// `update` only pulls, reinstalls dependencies, and restarts.
pub struct Deployment<'a> {
    config: &'a Config,
}

impl<'a> Deployment<'a> {
    #[must_use]
    pub const fn new(config: &'a Config) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn deploy_plan(&self) -> Plan<'_> {
        let config = self.config;

        Plan::new()
            .step("require-root", reconcile::require_root)
            .step("manifest", move |host| check_manifest(host, config))
            .step("venv", move |host| ensure_venv(host, config))
            .step("dependencies", move |host| install_dependencies(host, config))
            .step("service-unit", move |host| {
                systemd::install(host, &ServiceUnit::from_config(config), &config.unit_path())
            })
            .step("nginx-site", move |host| {
                nginx::apply(host, config, &nginx::current_site(host, config)?, Apply::Reload)
            })
            .step("firewall", move |host| RuleSet::from_config(config).apply(host))
            .step("start", move |host| {
                let enabled = systemd::enable(host, &config.service)?;
                Ok(enabled.and(systemd::restart(host, &config.service)?))
            })
    }

    #[must_use]
    pub fn update_plan(&self) -> Plan<'_> {
        let config = self.config;

        Plan::new()
            .step("require-root", reconcile::require_root)
            .step("manifest", move |host| check_manifest(host, config))
            .step("pull", move |host| pull(host, config))
            .step("dependencies", move |host| install_dependencies(host, config))
            .step("restart", move |host| systemd::restart(host, &config.service))
    }

    /// First-time (or repeated) full deployment.
    pub fn deploy(&self, host: &dyn Host) -> DeployResult<Report> {
        info!("deploying {} to {}", self.config.service, host.name());
        let report = self.deploy_plan().run(host)?;

        info!("deployment complete");
        info!("application available at {}", self.address(host));
        Ok(report)
    }

    /// Pull the latest revision and restart. Touches neither the
    /// proxy nor the firewall.
    pub fn update(&self, host: &dyn Host) -> DeployResult<Report> {
        info!("updating {} on {}", self.config.service, host.name());
        let report = self.update_plan().run(host)?;
        info!("update complete");
        Ok(report)
    }

    pub fn status(&self, host: &dyn Host) -> DeployResult<()> {
        systemd::status(host, &self.config.service)
    }

    pub fn logs(&self, host: &dyn Host, lines: u32, follow: bool) -> DeployResult<()> {
        systemd::journal(host, &self.config.service, lines, follow)
    }

    pub fn restart(&self, host: &dyn Host) -> DeployResult<()> {
        systemd::restart(host, &self.config.service)?;
        systemd::status(host, &self.config.service)
    }

    /// Where the application can be reached from outside. Never
    /// fails: lookups that go wrong are logged and a less precise
    /// address is returned.
    #[must_use]
    pub fn address(&self, host: &dyn Host) -> String {
        if let Some(domain) = &self.config.domain {
            let scheme = match nginx::tls_enabled(host, self.config) {
                Ok(true) => "https",
                Ok(false) => "http",
                Err(e) => {
                    warn!("could not read the proxy site: {e}");
                    "http"
                }
            };
            return format!("{scheme}://{domain}");
        }

        match tls::public_ipv4(host) {
            Ok(ip) => format!("http://{ip}"),
            Err(e) => {
                warn!("could not determine public address: {e}");
                format!("http://{}", host.name())
            }
        }
    }
}

/// The dependency manifest must be present before anything is
/// installed or written.
pub fn check_manifest(host: &dyn Host, config: &Config) -> DeployResult<Outcome> {
    let manifest = config.manifest_path();
    if host.exists(&manifest)? {
        Ok(Outcome::Unchanged)
    } else {
        Err(DeployError::ManifestMissing(manifest))
    }
}

fn ensure_venv(host: &dyn Host, config: &Config) -> DeployResult<Outcome> {
    let venv = config.venv_dir();
    if host.exists(&format!("{venv}/bin/python"))? {
        return Ok(Outcome::Unchanged);
    }
    info!("creating virtual environment {venv}");
    host.run_as(&config.user, "python3", &["-m", "venv", &venv])?;
    Ok(Outcome::Changed)
}

fn install_dependencies(host: &dyn Host, config: &Config) -> DeployResult<Outcome> {
    let pip = format!("{}/bin/pip", config.venv_dir());
    let manifest = config.manifest_path();

    info!("installing dependencies from {manifest}");
    host.run_as(&config.user, &pip, &["install", "-q", "--upgrade", "pip"])?;
    host.run_as(&config.user, &pip, &["install", "-q", "-r", &manifest])?;
    Ok(Outcome::Changed)
}

fn pull(host: &dyn Host, config: &Config) -> DeployResult<Outcome> {
    let app_dir = config.app_dir();
    let before = host.run_as(&config.user, "git", &["-C", &app_dir, "rev-parse", "HEAD"])?;
    host.run_as(
        &config.user,
        "git",
        &["-C", &app_dir, "pull", "--ff-only", "origin", &config.branch],
    )?;
    let after = host.run_as(&config.user, "git", &["-C", &app_dir, "rev-parse", "HEAD"])?;

    if before.trim() == after.trim() {
        info!("already at {}", short_rev(&after));
        Ok(Outcome::Unchanged)
    } else {
        info!("{} -> {}", short_rev(&before), short_rev(&after));
        Ok(Outcome::Changed)
    }
}

fn short_rev(rev: &str) -> &str {
    let rev = rev.trim();
    rev.get(..7).unwrap_or(rev)
}
