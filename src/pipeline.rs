use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use crate::bootstrap::{self, Bootstrap};
use crate::cmd;
use crate::config::Config;
use crate::deploy::Deployment;
use crate::error::{DeployError, DeployResult};
use crate::host::{Host, LocalHost, SshHost};
use crate::nginx::{Site, TlsFiles};
use crate::reconcile::{HostLock, Plan};
use crate::ssh::SshSession;
use crate::systemd::ServiceUnit;
use crate::tls::{Confirm, Preset, Prompt, TlsProvisioner};

const DEFAULT_CONFIG: &str = "hoist.yaml";

/// Binds a configuration to a target host and dispatches CLI
/// commands against it.
pub struct Pipeline {
    config: Config,
    host: Box<dyn Host>,
    dry_run: bool,
}

impl Pipeline {
    /// A pipeline acting on the local machine.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            host: Box::new(LocalHost::new()),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn host(mut self, host: impl Host + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Print artifacts and step plans instead of touching the host.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Build a pipeline from parsed arguments: load the config
    /// file, apply flag overrides, and connect to the target.
    pub fn from_cli(cli: &Cli) -> DeployResult<Self> {
        let mut config = match &cli.config {
            Some(path) => Config::load(path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => Config::load(Path::new(DEFAULT_CONFIG))?,
            None => Config::default(),
        };
        if let Some(domain) = &cli.domain {
            config.domain = Some(domain.clone());
        }
        if let Some(email) = &cli.email {
            config.email = Some(email.clone());
        }
        config.validate()?;

        let pipeline = Self::new(config).dry_run(cli.dry_run);
        let Some(target) = &cli.host else {
            return Ok(pipeline);
        };

        let mut session = SshSession::parse(target);
        if let Some(key) = &cli.identity {
            session = session.with_key(key);
        }
        if !cli.dry_run {
            if !cmd::command_exists("ssh") {
                return Err(DeployError::PrerequisiteMissing("ssh".into()));
            }
            session.check()?;
        }
        Ok(pipeline.host(SshHost::new(session)))
    }

    /// Run one command to completion.
    pub fn execute(&self, command: &Command) -> DeployResult<()> {
        let host = self.host.as_ref();
        let deployment = Deployment::new(&self.config);

        match command {
            Command::Bootstrap { no_upgrade } => {
                let bootstrap = Bootstrap::new(&self.config).upgrade(!no_upgrade);
                if self.dry_run {
                    self.preview_bootstrap(&bootstrap.plan());
                    return Ok(());
                }
                let _lock = self.lock()?;
                bootstrap.run(host)?;
            }
            Command::Deploy => {
                if self.dry_run {
                    self.preview_deploy(&deployment.deploy_plan());
                    return Ok(());
                }
                let _lock = self.lock()?;
                deployment.deploy(host)?;
            }
            Command::Update => {
                if self.dry_run {
                    preview_plan("update", &deployment.update_plan());
                    return Ok(());
                }
                let _lock = self.lock()?;
                deployment.update(host)?;
            }
            Command::Status => deployment.status(host)?,
            Command::Logs { lines, follow } => deployment.logs(host, *lines, *follow)?,
            Command::Restart => {
                let _lock = self.lock()?;
                deployment.restart(host)?;
            }
            Command::Tls(tls) => self.execute_tls(tls)?,
        }

        Ok(())
    }

    fn execute_tls(&self, command: &TlsCommand) -> DeployResult<()> {
        let host = self.host.as_ref();
        let mut config = self.config.clone();
        let (force, force_renewal) = match command {
            TlsCommand::Setup {
                force,
                staging,
                force_renewal,
            } => {
                config.staging |= *staging;
                (*force, *force_renewal)
            }
            _ => (false, false),
        };

        let confirm: Box<dyn Confirm> = if force {
            Box::new(Preset(true))
        } else {
            Box::new(Prompt)
        };
        let tls = TlsProvisioner::new(&config, confirm.as_ref())?.force_renewal(force_renewal);

        match command {
            TlsCommand::Setup { .. } => {
                if self.dry_run {
                    self.preview_tls(&tls.setup_plan());
                    return Ok(());
                }
                let _lock = self.lock()?;
                tls.setup(host)?;
            }
            TlsCommand::Renew => {
                let _lock = self.lock()?;
                tls.renew(host)?;
            }
            TlsCommand::Status => tls.status(host)?,
            TlsCommand::Test => tls.test(host)?,
        }

        Ok(())
    }

    fn lock(&self) -> DeployResult<HostLock<'_>> {
        let path = self.config.lock_path();
        info!("taking lock {path}");
        HostLock::acquire(self.host.as_ref(), &path)
    }

    fn preview_bootstrap(&self, plan: &Plan<'_>) {
        preview_plan("bootstrap", plan);
        preview_file(
            &self.config.site_available(),
            &Site::from_config(&self.config).render(),
        );
        preview_file(
            &self.config.logrotate_path(),
            &bootstrap::render_logrotate(&self.config),
        );
        preview_file(
            &self.config.monitor_path(),
            &bootstrap::render_monitor(&self.config),
        );
    }

    fn preview_deploy(&self, plan: &Plan<'_>) {
        preview_plan("deploy", plan);
        preview_file(
            &self.config.unit_path(),
            &ServiceUnit::from_config(&self.config).render(),
        );
        preview_file(
            &self.config.site_available(),
            &Site::from_config(&self.config).render(),
        );
        eprintln!("(the HTTPS block is kept when a certificate already exists)");
    }

    fn preview_tls(&self, plan: &Plan<'_>) {
        preview_plan("tls setup", plan);
        if let Some(domain) = &self.config.domain {
            let site = Site::from_config(&self.config).with_tls(TlsFiles::letsencrypt(domain));
            preview_file(&self.config.site_available(), &site.render());
        }
    }
}

fn preview_plan(command: &str, plan: &Plan<'_>) {
    eprintln!("=== Dry run: no changes will be made ===");
    eprintln!();
    eprintln!("--- Steps for `{command}` ---");
    for (i, name) in plan.names().iter().enumerate() {
        eprintln!("{}. {name}", i + 1);
    }
    eprintln!();
}

fn preview_file(path: &str, content: &str) {
    eprintln!("--- {path} ---");
    println!("{content}");
}

#[derive(Parser)]
#[command(name = "hoist", version)]
#[command(about = "Bootstrap a host, deploy a FastAPI service behind Nginx, and provision TLS")]
pub struct Cli {
    /// Config file [default: hoist.yaml if present]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run against a remote host over SSH (user@addr)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// SSH private key for --host
    #[arg(short = 'i', long, global = true)]
    pub identity: Option<String>,

    /// Override the configured domain
    #[arg(long, global = true)]
    pub domain: Option<String>,

    /// Override the configured ACME account email
    #[arg(long, global = true)]
    pub email: Option<String>,

    /// Preview generated files and steps without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Prepare a fresh host (packages, firewall, user, nginx)
    Bootstrap {
        /// Skip `apt-get upgrade`
        #[arg(long)]
        no_upgrade: bool,
    },

    /// Install the application and start the service
    Deploy,

    /// Pull the latest code, reinstall dependencies, restart
    Update,

    /// Show service status
    Status,

    /// Show service logs
    Logs {
        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: u32,

        /// Keep following the log
        #[arg(short, long)]
        follow: bool,
    },

    /// Restart the service
    Restart,

    /// Certificate management
    #[command(subcommand)]
    Tls(TlsCommand),
}

#[derive(Subcommand)]
pub enum TlsCommand {
    /// Issue a certificate and enable HTTPS
    Setup {
        /// Continue even if DNS does not point at this host
        #[arg(long)]
        force: bool,

        /// Use the Let's Encrypt staging CA
        #[arg(long)]
        staging: bool,

        /// Re-issue even if a valid certificate exists
        #[arg(long)]
        force_renewal: bool,
    },

    /// Renew certificates and reload nginx
    Renew,

    /// Show certificate and HTTPS status
    Status,

    /// Check the health endpoint over HTTPS
    Test,
}
