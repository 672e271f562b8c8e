use std::fmt;
use std::io::{BufRead, IsTerminal, Write};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::host::Host;
use crate::nginx::{self, Apply, Site, TlsFiles};
use crate::reconcile::{self, Outcome, Plan, Report};
use crate::systemd;

const PUBLIC_IP_URL: &str = "https://api.ipify.org?format=json";
const RELOAD_HOOK: &str = "/etc/letsencrypt/renewal-hooks/deploy/reload-nginx.sh";

/// Operator approval for continuing past a DNS mismatch.
pub trait Confirm {
    fn confirm(&self, question: &str) -> DeployResult<bool>;
}

/// A fixed answer, for `--force` and non-interactive runs.
#[derive(Debug, Clone, Copy)]
pub struct Preset(pub bool);

impl Confirm for Preset {
    fn confirm(&self, _question: &str) -> DeployResult<bool> {
        Ok(self.0)
    }
}

/// Ask on the terminal; declines when stdin is not a terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, question: &str) -> DeployResult<bool> {
        let stdin = std::io::stdin();
        let interactive = stdin.is_terminal();
        ask(question, interactive, &mut stdin.lock(), &mut std::io::stderr())
    }
}

/// Put `question` to the operator and accept only `yes`. Declines
/// without reading when there is no terminal to answer from.
fn ask(
    question: &str,
    interactive: bool,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> DeployResult<bool> {
    if !interactive {
        warn!("not a terminal, declining: {question}");
        return Ok(false);
    }

    write!(output, "{question} Type 'yes' to continue: ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

/// A certificate as listed by `certbot certificates`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub domains: Vec<String>,
    pub expiry: Option<String>,
    pub days_left: Option<u32>,
    pub valid: bool,
    pub certificate_path: Option<String>,
    pub key_path: Option<String>,
}

/// Parse the human-readable output of `certbot certificates`.
#[must_use]
pub fn parse_certificates(output: &str) -> Vec<Certificate> {
    let mut certs: Vec<Certificate> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        let value = value.trim();

        if key == "Certificate Name" {
            certs.push(Certificate {
                name: value.to_string(),
                ..Certificate::default()
            });
            continue;
        }
        let Some(cert) = certs.last_mut() else {
            continue;
        };
        match key {
            "Domains" => {
                cert.domains = value.split_whitespace().map(ToString::to_string).collect();
            }
            "Expiry Date" => {
                let (date, note) = value.split_once(" (").unwrap_or((value, ""));
                cert.expiry = Some(date.trim().to_string());
                cert.valid = note.starts_with("VALID");
                cert.days_left = note
                    .strip_prefix("VALID:")
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|n| n.parse().ok());
            }
            "Certificate Path" => cert.certificate_path = Some(value.to_string()),
            "Private Key Path" => cert.key_path = Some(value.to_string()),
            _ => {}
        }
    }

    certs
}

/// What `tls status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsStatus {
    pub domain: String,
    pub certificate: Option<Certificate>,
    pub https: bool,
    pub auto_renew: bool,
}

impl fmt::Display for TlsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enabled = |on: bool| if on { "enabled" } else { "disabled" };

        match &self.certificate {
            Some(cert) => {
                writeln!(f, "certificate: {}", cert.name)?;
                writeln!(f, "domains:     {}", cert.domains.join(" "))?;
                let state = match (cert.valid, cert.days_left) {
                    (true, Some(days)) => format!("valid, {days} days left"),
                    (true, None) => "valid".to_string(),
                    (false, _) => "INVALID".to_string(),
                };
                writeln!(
                    f,
                    "expires:     {} ({state})",
                    cert.expiry.as_deref().unwrap_or("unknown")
                )?;
            }
            None => writeln!(f, "certificate: none for {}", self.domain)?,
        }
        writeln!(f, "proxy https: {}", enabled(self.https))?;
        writeln!(f, "auto-renew:  {}", enabled(self.auto_renew))
    }
}

/// Unique IPv4 addresses from `getent ahostsv4` output.
#[must_use]
pub fn parse_getent(output: &str) -> Vec<String> {
    let mut addrs: Vec<String> = Vec::new();
    for line in output.lines() {
        if let Some(addr) = line.split_whitespace().next() {
            if !addrs.iter().any(|a| a == addr) {
                addrs.push(addr.to_string());
            }
        }
    }
    addrs
}

/// IPv4 addresses the domain resolves to, as seen from the host.
/// An unresolvable name yields an empty list.
pub fn resolve_ipv4(host: &dyn Host, domain: &str) -> DeployResult<Vec<String>> {
    match host.run("getent", &["ahostsv4", domain]) {
        Ok(out) => Ok(parse_getent(&out)),
        Err(DeployError::CommandFailed { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

#[derive(Deserialize)]
struct PublicIp {
    ip: String,
}

/// The host's public IPv4 address, asked from an external echo
/// service.
pub fn public_ipv4(host: &dyn Host) -> DeployResult<String> {
    let body = host.run("curl", &["-s", "--fail", "--max-time", "10", PUBLIC_IP_URL])?;
    let parsed: PublicIp = serde_json::from_str(&body)?;
    Ok(parsed.ip)
}

/// GET `url` from the host and require a 2xx status.
pub fn health_check(host: &dyn Host, url: &str) -> DeployResult<u16> {
    let out = host
        .run(
            "curl",
            &["-s", "-o", "/dev/null", "-w", "%{http_code}", "--max-time", "10", url],
        )
        .map_err(|e| DeployError::HealthcheckFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let code: u16 = out.trim().parse().map_err(|_| DeployError::HealthcheckFailed {
        url: url.to_string(),
        reason: format!("unexpected curl output '{}'", out.trim()),
    })?;

    if (200..300).contains(&code) {
        Ok(code)
    } else {
        Err(DeployError::HealthcheckFailed {
            url: url.to_string(),
            reason: format!("HTTP {code}"),
        })
    }
}

/// Certificate issuance and HTTPS enablement for the configured
/// domain.
pub struct TlsProvisioner<'a> {
    config: &'a Config,
    confirm: &'a dyn Confirm,
    force_renewal: bool,
}

impl<'a> TlsProvisioner<'a> {
    pub fn new(config: &'a Config, confirm: &'a dyn Confirm) -> DeployResult<Self> {
        if config.domain.is_none() {
            return Err(DeployError::Config(
                "a domain is required for TLS (set `domain` or pass --domain)".into(),
            ));
        }
        Ok(Self {
            config,
            confirm,
            force_renewal: false,
        })
    }

    /// Re-issue even when a valid certificate exists.
    #[must_use]
    pub const fn force_renewal(mut self, force: bool) -> Self {
        self.force_renewal = force;
        self
    }

    fn domain(&self) -> &str {
        self.config.domain.as_deref().unwrap_or_default()
    }

    /// `https://<domain><health path>`
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("https://{}{}", self.domain(), self.config.health_path)
    }

    /// `require-root → check-domain → issue-certificate →
    /// test-renewal → update-proxy-config → verify`.
    #[must_use]
    pub fn setup_plan(&self) -> Plan<'_> {
        Plan::new()
            .step("require-root", reconcile::require_root)
            .step("check-domain", move |host| self.check_domain(host))
            .step("issue-certificate", move |host| self.issue(host))
            .step("test-renewal", move |host| self.test_renewal(host))
            .step("update-proxy-config", move |host| {
                let site = Site::from_config(self.config)
                    .with_tls(TlsFiles::letsencrypt(self.domain()));
                nginx::apply(host, self.config, &site, Apply::Reload)
            })
            .step("verify", move |host| {
                let url = self.health_url();
                match health_check(host, &url) {
                    Ok(code) => info!("{url} answered {code}"),
                    Err(e) => warn!("{e} (certificate is installed; check the app)"),
                }
                Ok(Outcome::Unchanged)
            })
    }

    pub fn setup(&self, host: &dyn Host) -> DeployResult<Report> {
        info!("provisioning TLS for {} on {}", self.domain(), host.name());
        let report = self.setup_plan().run(host)?;
        info!("HTTPS enabled: https://{}", self.domain());
        Ok(report)
    }

    pub fn renew(&self, host: &dyn Host) -> DeployResult<()> {
        host.run_interactive("certbot", &["renew", "--cert-name", self.domain()])?;
        systemd::reload(host, "nginx")?;
        Ok(())
    }

    /// Certificate, proxy and renewal state for the domain.
    pub fn inspect(&self, host: &dyn Host) -> DeployResult<TlsStatus> {
        let out = host.run("certbot", &["certificates", "--cert-name", self.domain()])?;
        let certificate = parse_certificates(&out)
            .into_iter()
            .find(|c| c.name == self.domain() || c.domains.iter().any(|d| d == self.domain()));

        Ok(TlsStatus {
            domain: self.domain().to_string(),
            certificate,
            https: nginx::tls_enabled(host, self.config)?,
            auto_renew: host.succeeds("systemctl", &["is-enabled", "--quiet", "certbot.timer"])?,
        })
    }

    pub fn status(&self, host: &dyn Host) -> DeployResult<()> {
        print!("{}", self.inspect(host)?);
        Ok(())
    }

    /// HTTPS health check where failure is an error.
    pub fn test(&self, host: &dyn Host) -> DeployResult<()> {
        let url = self.health_url();
        let code = health_check(host, &url)?;
        info!("{url} answered {code}");
        Ok(())
    }

    fn check_domain(&self, host: &dyn Host) -> DeployResult<Outcome> {
        let domain = self.domain();
        let resolved = resolve_ipv4(host, domain)?;
        let public = public_ipv4(host)?;

        if resolved.iter().any(|a| *a == public) {
            info!("{domain} resolves to {public}");
            return Ok(Outcome::Unchanged);
        }

        let mismatch = DeployError::DnsMismatch {
            domain: domain.to_string(),
            resolved,
            public,
        };
        warn!("{mismatch}");
        warn!("certificate issuance will fail until DNS points at this host");

        if self.confirm.confirm("Continue anyway?")? {
            warn!("continuing despite DNS mismatch");
            Ok(Outcome::Unchanged)
        } else {
            Err(mismatch)
        }
    }

    fn existing_valid(&self, host: &dyn Host) -> DeployResult<bool> {
        let out = match host.run("certbot", &["certificates", "--cert-name", self.domain()]) {
            Ok(out) => out,
            Err(DeployError::CommandFailed { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let covered = parse_certificates(&out)
            .iter()
            .any(|c| c.valid && c.domains.iter().any(|d| d == self.domain()));
        let files = TlsFiles::letsencrypt(self.domain());
        Ok(covered && host.exists(&files.certificate)? && host.exists(&files.key)?)
    }

    fn issue(&self, host: &dyn Host) -> DeployResult<Outcome> {
        if !self.force_renewal && self.existing_valid(host)? {
            info!("valid certificate for {} already present", self.domain());
            return Ok(Outcome::Unchanged);
        }

        let email = self.config.email.as_deref().ok_or_else(|| {
            DeployError::Config("an email is required for certificate issuance".into())
        })?;

        reconcile::ensure_dir(host, &self.config.webroot, None)?;

        let mut args = vec![
            "certonly",
            "--webroot",
            "-w",
            self.config.webroot.as_str(),
            "-d",
            self.domain(),
            "--email",
            email,
            "--agree-tos",
            "--non-interactive",
            "--keep-until-expiring",
        ];
        if self.config.staging {
            args.push("--staging");
        }
        if self.force_renewal {
            args.push("--force-renewal");
        }

        info!("requesting certificate for {}", self.domain());
        host.run_interactive("certbot", &args)?;
        Ok(Outcome::Changed)
    }

    fn test_renewal(&self, host: &dyn Host) -> DeployResult<Outcome> {
        host.run("certbot", &["renew", "--dry-run", "--cert-name", self.domain()])?;

        let hook = "#!/bin/sh\n# Managed by hoist.\nsystemctl reload nginx\n";
        let outcome = reconcile::ensure_file(host, RELOAD_HOOK, hook, 0o755)?;

        if !host.succeeds("systemctl", &["is-enabled", "--quiet", "certbot.timer"])? {
            warn!("certbot.timer is not enabled; certificates will not renew automatically");
        }
        Ok(outcome)
    }
}
