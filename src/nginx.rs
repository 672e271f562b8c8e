use std::fmt::Write as _;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::host::Host;
use crate::reconcile::{self, Outcome};
use crate::systemd;

const DEFAULT_SITE: &str = "/etc/nginx/sites-enabled/default";

/// Certificate material referenced by the HTTPS server block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: String,
    pub key: String,
}

impl TlsFiles {
    /// certbot's `live/` layout for a domain.
    #[must_use]
    pub fn letsencrypt(domain: &str) -> Self {
        Self {
            certificate: format!("/etc/letsencrypt/live/{domain}/fullchain.pem"),
            key: format!("/etc/letsencrypt/live/{domain}/privkey.pem"),
        }
    }
}

/// The reverse-proxy site in front of the app.
///
/// Without [`TlsFiles`] it renders one plain HTTP server block that
/// proxies to the app. With them the HTTP block only answers ACME
/// challenges and redirects, and a second block terminates TLS.
///
/// # Example
///
/// ```
/// use hoist::{Config, Site};
///
/// let site = Site::from_config(&Config::default().domain("api.example.com"));
/// let text = site.render();
///
/// assert!(text.contains("server_name api.example.com;"));
/// assert!(text.contains("proxy_pass http://127.0.0.1:8000;"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub server_name: String,
    pub upstream: String,
    pub webroot: String,
    pub client_max_body_size: String,
    pub tls: Option<TlsFiles>,
}

/// Scheme a server block listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Site {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.service.clone(),
            server_name: config.domain.clone().unwrap_or_else(|| "_".to_string()),
            upstream: config.upstream(),
            webroot: config.webroot.clone(),
            client_max_body_size: config.client_max_body_size.clone(),
            tls: None,
        }
    }

    #[must_use]
    pub fn with_tls(mut self, files: TlsFiles) -> Self {
        self.tls = Some(files);
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Managed by hoist. Local edits are overwritten on deploy.\n");

        out.push_str("server {\n");
        out.push_str("    listen 80;\n");
        out.push_str("    listen [::]:80;\n");
        let _ = writeln!(out, "    server_name {};", self.server_name);
        out.push('\n');
        self.acme_location(&mut out);
        if self.tls.is_some() {
            out.push_str("    location / {\n");
            out.push_str("        return 301 https://$host$request_uri;\n");
            out.push_str("    }\n");
        } else {
            self.common(&mut out);
        }
        out.push_str("}\n");

        if let Some(tls) = &self.tls {
            out.push_str("\nserver {\n");
            out.push_str("    listen 443 ssl http2;\n");
            out.push_str("    listen [::]:443 ssl http2;\n");
            let _ = writeln!(out, "    server_name {};", self.server_name);
            out.push('\n');
            let _ = writeln!(out, "    ssl_certificate {};", tls.certificate);
            let _ = writeln!(out, "    ssl_certificate_key {};", tls.key);
            out.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
            out.push_str("    ssl_prefer_server_ciphers off;\n");
            out.push_str("    ssl_session_cache shared:SSL:10m;\n");
            out.push_str("    ssl_session_timeout 1d;\n");
            out.push_str(
                "    add_header Strict-Transport-Security \
                 \"max-age=31536000; includeSubDomains\" always;\n",
            );
            out.push('\n');
            self.acme_location(&mut out);
            self.common(&mut out);
            out.push_str("}\n");
        }

        out
    }

    fn acme_location(&self, out: &mut String) {
        out.push_str("    location /.well-known/acme-challenge/ {\n");
        let _ = writeln!(out, "        root {};", self.webroot);
        out.push_str("    }\n\n");
    }

    fn common(&self, out: &mut String) {
        let _ = writeln!(out, "    client_max_body_size {};", self.client_max_body_size);
        let _ = writeln!(out, "    access_log /var/log/nginx/{}.access.log;", self.name);
        let _ = writeln!(out, "    error_log /var/log/nginx/{}.error.log;", self.name);
        out.push('\n');
        out.push_str("    location / {\n");
        let _ = writeln!(out, "        proxy_pass http://{};", self.upstream);
        out.push_str("        proxy_http_version 1.1;\n");
        out.push_str("        proxy_set_header Host $host;\n");
        out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
        out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
        out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
        out.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
        out.push_str("        proxy_set_header Connection \"upgrade\";\n");
        out.push_str("        proxy_connect_timeout 60s;\n");
        out.push_str("        proxy_read_timeout 60s;\n");
        out.push_str("    }\n");
    }
}

/// Scheme of every top-level `server` block in an Nginx config.
///
/// A block counts as HTTPS when one of its `listen` directives
/// carries `ssl`.
#[must_use]
pub fn server_blocks(config: &str) -> Vec<Scheme> {
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut in_server = false;
    let mut ssl = false;

    for raw in config.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if depth == 0 && line.starts_with("server") && line.ends_with('{') {
            in_server = true;
            ssl = false;
        } else if in_server && depth == 1 && line.starts_with("listen") {
            ssl |= line
                .trim_end_matches(';')
                .split_whitespace()
                .any(|t| t == "ssl");
        }

        depth += line.matches('{').count();
        depth = depth.saturating_sub(line.matches('}').count());

        if in_server && depth == 0 {
            blocks.push(if ssl { Scheme::Https } else { Scheme::Http });
            in_server = false;
        }
    }

    blocks
}

/// How to make Nginx pick up a changed site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    Restart,
    Reload,
}

/// The site every procedure should install: HTTPS stays enabled
/// once certificate and key for the configured domain exist, so
/// re-running an earlier procedure never drops it.
pub fn current_site(host: &dyn Host, config: &Config) -> DeployResult<Site> {
    let site = Site::from_config(config);
    let Some(domain) = &config.domain else {
        return Ok(site);
    };

    let files = TlsFiles::letsencrypt(domain);
    if host.exists(&files.certificate)? && host.exists(&files.key)? {
        Ok(site.with_tls(files))
    } else {
        Ok(site)
    }
}

/// Install the site, enable it, drop the stock default site, and
/// restart or reload Nginx once the config test passes.
///
/// `nginx -t` runs on every call. When it fails after this call
/// changed the site, the previous site file is put back so the
/// next run sees the difference and reloads once the config is
/// valid.
pub fn apply(host: &dyn Host, config: &Config, site: &Site, mode: Apply) -> DeployResult<Outcome> {
    if let Some(tls) = &site.tls {
        for path in [&tls.certificate, &tls.key] {
            if !host.exists(path)? {
                return Err(DeployError::FileNotFound(format!(
                    "{path} (issue the certificate before enabling HTTPS)"
                )));
            }
        }
    }

    let available = config.site_available();
    let previous = host.read_file(&available)?;
    let outcome = reconcile::ensure_file(host, &available, &site.render(), 0o644)?
        .and(reconcile::ensure_symlink(host, &available, &config.site_enabled())?)
        .and(reconcile::ensure_absent(host, DEFAULT_SITE)?);

    info!("testing nginx configuration");
    if let Err(e) = host.run("nginx", &["-t"]) {
        if outcome.changed() {
            if let Err(restore) = restore_site(host, config, previous.as_deref()) {
                warn!("could not restore {available}: {restore}");
            }
        }
        return Err(e);
    }

    if outcome.changed() {
        match mode {
            Apply::Restart => systemd::restart(host, "nginx")?,
            Apply::Reload => systemd::reload(host, "nginx")?,
        };
    }

    Ok(outcome.and(systemd::ensure_active(host, "nginx")?))
}

fn restore_site(host: &dyn Host, config: &Config, previous: Option<&str>) -> DeployResult<()> {
    let available = config.site_available();
    match previous {
        Some(text) => {
            warn!("nginx rejected the new config, restoring {available}");
            host.write_file(&available, text, 0o644)
        }
        None => {
            warn!("nginx rejected the new config, removing {available}");
            reconcile::ensure_absent(host, &config.site_enabled())?;
            reconcile::ensure_absent(host, &available)?;
            Ok(())
        }
    }
}

/// Whether the installed site already terminates TLS.
pub fn tls_enabled(host: &dyn Host, config: &Config) -> DeployResult<bool> {
    Ok(host
        .read_file(&config.site_available())?
        .is_some_and(|text| server_blocks(&text).contains(&Scheme::Https)))
}
