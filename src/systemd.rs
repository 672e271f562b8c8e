use std::fmt::Write as _;

use indexmap::IndexMap;
use tracing::info;

use crate::config::Config;
use crate::error::DeployResult;
use crate::host::Host;
use crate::reconcile::{self, Outcome};

/// A systemd service unit supervising the uvicorn process.
///
/// # Example
///
/// ```
/// use hoist::{Config, ServiceUnit};
///
/// let unit = ServiceUnit::from_config(&Config::default());
/// let text = unit.render();
///
/// assert!(text.contains("WorkingDirectory=/home/ubuntu/fastapi-app"));
/// assert!(text.contains("Restart=always"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    pub user: String,
    pub group: String,
    pub working_directory: String,
    pub exec_start: String,
    pub environment: IndexMap<String, String>,
    pub environment_file: Option<String>,
    pub restart_sec: u32,
}

impl ServiceUnit {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let app_dir = config.app_dir();
        let venv = config.venv_dir();

        let mut environment = IndexMap::new();
        environment.insert("PATH".to_string(), format!("{venv}/bin"));
        environment.insert("LOG_DIR".to_string(), config.logs_dir());
        for (k, v) in &config.env {
            environment.insert(k.clone(), v.clone());
        }

        Self {
            name: config.service.clone(),
            description: format!("{} (uvicorn)", config.service),
            user: config.user.clone(),
            group: config.user.clone(),
            working_directory: app_dir.clone(),
            exec_start: format!(
                "{venv}/bin/uvicorn {} --host 127.0.0.1 --port {} --workers {}",
                config.entry_point, config.port, config.workers
            ),
            environment,
            environment_file: Some(format!("{app_dir}/.env")),
            restart_sec: config.restart_sec,
        }
    }

    /// Render the unit file.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Managed by hoist. Local edits are overwritten on deploy.\n");
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        out.push_str("After=network.target\n");
        out.push_str("Wants=network-online.target\n\n");

        out.push_str("[Service]\n");
        out.push_str("Type=simple\n");
        let _ = writeln!(out, "User={}", self.user);
        let _ = writeln!(out, "Group={}", self.group);
        let _ = writeln!(out, "WorkingDirectory={}", self.working_directory);
        for (k, v) in &self.environment {
            let _ = writeln!(out, "Environment=\"{k}={}\"", v.replace('"', "\\\""));
        }
        if let Some(file) = &self.environment_file {
            // leading '-' makes the file optional
            let _ = writeln!(out, "EnvironmentFile=-{file}");
        }
        let _ = writeln!(out, "ExecStart={}", self.exec_start);
        out.push_str("Restart=always\n");
        let _ = writeln!(out, "RestartSec={}", self.restart_sec);
        out.push_str("KillMode=mixed\n");
        out.push_str("TimeoutStopSec=30\n\n");

        out.push_str("[Install]\n");
        out.push_str("WantedBy=multi-user.target\n");
        out
    }
}

/// Write the unit file and reload systemd when it changed.
pub fn install(host: &dyn Host, unit: &ServiceUnit, path: &str) -> DeployResult<Outcome> {
    let outcome = reconcile::ensure_file(host, path, &unit.render(), 0o644)?;
    if outcome.changed() {
        host.run("systemctl", &["daemon-reload"])?;
    }
    Ok(outcome)
}

/// Enable the unit at boot. Reports `Changed` only when it was
/// not enabled before.
pub fn enable(host: &dyn Host, service: &str) -> DeployResult<Outcome> {
    if host.succeeds("systemctl", &["is-enabled", "--quiet", service])? {
        return Ok(Outcome::Unchanged);
    }
    host.run("systemctl", &["enable", service])?;
    Ok(Outcome::Changed)
}

pub fn restart(host: &dyn Host, service: &str) -> DeployResult<Outcome> {
    info!("restarting {service}");
    host.run("systemctl", &["restart", service])?;
    Ok(Outcome::Changed)
}

pub fn reload(host: &dyn Host, service: &str) -> DeployResult<Outcome> {
    host.run("systemctl", &["reload", service])?;
    Ok(Outcome::Changed)
}

/// Start a unit unless it is already running.
pub fn ensure_active(host: &dyn Host, service: &str) -> DeployResult<Outcome> {
    if host.succeeds("systemctl", &["is-active", "--quiet", service])? {
        return Ok(Outcome::Unchanged);
    }
    host.run("systemctl", &["start", service])?;
    Ok(Outcome::Changed)
}

pub fn status(host: &dyn Host, service: &str) -> DeployResult<()> {
    host.run_interactive("systemctl", &["status", service, "--no-pager", "--lines=10"])
}

pub fn journal(host: &dyn Host, service: &str, lines: u32, follow: bool) -> DeployResult<()> {
    let count = lines.to_string();
    let mut args = vec!["-u", service, "-n", count.as_str(), "--no-pager"];
    if follow {
        args.push("-f");
    }
    host.run_interactive("journalctl", &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_start_binds_loopback_port() {
        let unit = ServiceUnit::from_config(&Config::default());

        assert_eq!(
            unit.exec_start,
            "/home/ubuntu/fastapi-app/venv/bin/uvicorn app.main:app \
             --host 127.0.0.1 --port 8000 --workers 2"
        );
    }

    #[test]
    fn render_has_fixed_backoff_and_owner() {
        let text = ServiceUnit::from_config(&Config::default()).render();

        assert!(text.contains("\nRestart=always\n"));
        assert!(text.contains("\nRestartSec=5\n"));
        assert!(text.contains("\nUser=ubuntu\n"));
        assert!(text.contains("\nGroup=ubuntu\n"));
        assert!(text.contains("EnvironmentFile=-/home/ubuntu/fastapi-app/.env"));
        assert!(text.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn config_env_follows_builtin_env() {
        let config = Config::default()
            .env("ENVIRONMENT", "production")
            .env("GREETING", "say \"hi\"");
        let text = ServiceUnit::from_config(&config).render();

        let path = text.find("Environment=\"PATH=").unwrap();
        let env = text.find("Environment=\"ENVIRONMENT=production\"").unwrap();
        assert!(path < env);
        assert!(text.contains(r#"Environment="GREETING=say \"hi\"""#));
    }

    #[test]
    fn config_env_can_override_path() {
        let config = Config::default().env("PATH", "/opt/bin");
        let unit = ServiceUnit::from_config(&config);

        assert_eq!(unit.environment.get("PATH").map(String::as_str), Some("/opt/bin"));
        assert_eq!(unit.environment.get_index_of("PATH"), Some(0));
    }
}
