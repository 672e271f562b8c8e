use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{DeployError, DeployResult};

/// Everything the procedures need to know about the service and
/// the host it lives on. Loaded from `hoist.yaml`; every field has
/// a default so an empty file describes the stock FastAPI layout.
///
/// # Example
///
/// ```
/// use hoist::Config;
///
/// let config = Config::new("api")
///     .user("deploy")
///     .domain("api.example.com")
///     .email("ops@example.com")
///     .env("ENVIRONMENT", "production");
///
/// assert_eq!(config.app_dir(), "/home/deploy/api");
/// assert_eq!(config.venv_dir(), "/home/deploy/api/venv");
/// assert_eq!(config.port, 8000);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// systemd service name, also used for the Nginx site.
    pub service: String,
    /// Unprivileged account that owns and runs the app.
    pub user: String,
    /// Application source directory; `/home/<user>/<service>`
    /// when unset.
    pub app_dir: Option<String>,
    /// Branch pulled by `update`.
    pub branch: String,
    /// ASGI entry point handed to uvicorn.
    pub entry_point: String,
    /// Loopback port the app listens on.
    pub port: u16,
    pub workers: u32,
    /// Fixed restart backoff in seconds.
    pub restart_sec: u32,
    /// Dependency manifest, relative to the app directory.
    pub manifest: String,
    pub health_path: String,
    pub domain: Option<String>,
    pub email: Option<String>,
    /// ACME HTTP-01 webroot served by Nginx.
    pub webroot: String,
    /// Extra inbound port left open for direct operational access.
    pub ops_port: u16,
    pub packages: Vec<String>,
    pub env: IndexMap<String, String>,
    pub client_max_body_size: String,
    /// Use the Let's Encrypt staging CA.
    pub staging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: "fastapi-app".to_string(),
            user: "ubuntu".to_string(),
            app_dir: None,
            branch: "main".to_string(),
            entry_point: "app.main:app".to_string(),
            port: 8000,
            workers: 2,
            restart_sec: 5,
            manifest: "requirements.txt".to_string(),
            health_path: "/health".to_string(),
            domain: None,
            email: None,
            webroot: "/var/www/certbot".to_string(),
            ops_port: 8000,
            packages: default_packages(),
            env: IndexMap::new(),
            client_max_body_size: "10M".to_string(),
            staging: false,
        }
    }
}

fn default_packages() -> Vec<String> {
    [
        "python3",
        "python3-venv",
        "python3-pip",
        "python3-dev",
        "build-essential",
        "nginx",
        "ufw",
        "git",
        "curl",
        "certbot",
        "logrotate",
        "htop",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Config {
    #[must_use]
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }

    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> DeployResult<Self> {
        if !path.exists() {
            return Err(DeployError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text. An empty document yields the
    /// defaults.
    pub fn from_yaml(content: &str) -> DeployResult<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    #[must_use]
    pub fn app_dir_path(mut self, dir: &str) -> Self {
        self.app_dir = Some(dir.to_string());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    #[must_use]
    pub fn email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> DeployResult<()> {
        let valid_name = !self.service.is_empty()
            && self
                .service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.@".contains(c));
        if !valid_name {
            return Err(DeployError::Config(format!(
                "service name '{}' is not a valid unit name",
                self.service
            )));
        }
        if self.user.is_empty() || self.user == "root" {
            return Err(DeployError::Config(
                "user must be an unprivileged account".into(),
            ));
        }
        if self.port == 0 {
            return Err(DeployError::Config("port must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(DeployError::Config("workers must be at least 1".into()));
        }
        if let Some(dir) = &self.app_dir {
            if !dir.starts_with('/') {
                return Err(DeployError::Config(format!(
                    "app_dir must be absolute: {dir}"
                )));
            }
        }
        if !self.webroot.starts_with('/') {
            return Err(DeployError::Config(format!(
                "webroot must be absolute: {}",
                self.webroot
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(DeployError::Config(format!(
                "health_path must start with '/': {}",
                self.health_path
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn home_dir(&self) -> String {
        format!("/home/{}", self.user)
    }

    #[must_use]
    pub fn app_dir(&self) -> String {
        self.app_dir
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.home_dir(), self.service))
    }

    #[must_use]
    pub fn venv_dir(&self) -> String {
        format!("{}/venv", self.app_dir())
    }

    #[must_use]
    pub fn logs_dir(&self) -> String {
        format!("{}/logs", self.app_dir())
    }

    #[must_use]
    pub fn manifest_path(&self) -> String {
        format!("{}/{}", self.app_dir(), self.manifest)
    }

    #[must_use]
    pub fn unit_path(&self) -> String {
        format!("/etc/systemd/system/{}.service", self.service)
    }

    #[must_use]
    pub fn site_available(&self) -> String {
        format!("/etc/nginx/sites-available/{}", self.service)
    }

    #[must_use]
    pub fn site_enabled(&self) -> String {
        format!("/etc/nginx/sites-enabled/{}", self.service)
    }

    #[must_use]
    pub fn logrotate_path(&self) -> String {
        format!("/etc/logrotate.d/{}", self.service)
    }

    #[must_use]
    pub fn monitor_path(&self) -> String {
        format!("{}/monitor.sh", self.home_dir())
    }

    #[must_use]
    pub fn lock_path(&self) -> String {
        format!("/run/lock/hoist-{}.lock", self.service)
    }

    /// `127.0.0.1:<port>`, the only address the app binds.
    #[must_use]
    pub fn upstream(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Directory certbot stores the live certificate in.
    #[must_use]
    pub fn cert_dir(&self) -> Option<String> {
        self.domain
            .as_ref()
            .map(|d| format!("/etc/letsencrypt/live/{d}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.service, "fastapi-app");
        assert_eq!(config.user, "ubuntu");
        assert_eq!(config.app_dir(), "/home/ubuntu/fastapi-app");
        assert_eq!(config.port, 8000);
        assert_eq!(config.ops_port, 8000);
        assert_eq!(config.entry_point, "app.main:app");
        assert_eq!(config.manifest_path(), "/home/ubuntu/fastapi-app/requirements.txt");
        assert!(config.packages.iter().any(|p| p == "nginx"));
        assert!(config.domain.is_none());
        assert!(config.cert_dir().is_none());
    }

    #[test]
    fn empty_yaml_is_default() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.service, "fastapi-app");
    }

    #[test]
    fn yaml_overrides_and_keeps_env_order() {
        let config = Config::from_yaml(
            "\
service: shop-api
user: deploy
app_dir: /srv/shop
domain: shop.example.com
env:
  ZETA: \"1\"
  ALPHA: \"2\"
",
        )
        .unwrap();

        assert_eq!(config.app_dir(), "/srv/shop");
        assert_eq!(config.unit_path(), "/etc/systemd/system/shop-api.service");
        assert_eq!(
            config.cert_dir().as_deref(),
            Some("/etc/letsencrypt/live/shop.example.com")
        );
        let keys: Vec<&str> = config.env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ZETA", "ALPHA"]);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = Config::from_yaml("servce: typo\n").unwrap_err();
        assert!(matches!(err, DeployError::Yaml(_)));
    }

    #[test]
    fn relative_app_dir_is_rejected() {
        let err = Config::from_yaml("app_dir: app\n").unwrap_err();
        assert!(err.to_string().contains("app_dir must be absolute"));
    }

    #[test]
    fn root_user_is_rejected() {
        let err = Config::from_yaml("user: root\n").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn bad_service_name_is_rejected() {
        let err = Config::from_yaml("service: \"my app\"\n").unwrap_err();
        assert!(err.to_string().contains("not a valid unit name"));
    }
}
