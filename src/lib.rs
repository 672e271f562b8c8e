//! Host bootstrap, service deployment, and TLS provisioning for a
//! Python ASGI application behind Nginx.
//!
//! `hoist` takes a bare Ubuntu machine to a running FastAPI service
//! with HTTPS in three commands, each safe to re-run:
//!
//! 1. **Bootstrap** - packages, firewall, service account,
//!    directories, the Nginx site, log rotation, and a
//!    monitoring helper
//! 2. **Deploy** - virtual environment, dependencies, systemd
//!    unit, Nginx site, firewall, service start; plus `update`
//!    (pull, reinstall, restart) and `status`/`logs`/`restart`
//! 3. **TLS** - DNS check, Let's Encrypt certificate via certbot,
//!    renewal test, HTTPS server block, HTTPS health check
//!
//! # Architecture
//!
//! Each procedure is a [`Plan`](reconcile::Plan): an ordered list
//! of named steps that compare desired state with the host and
//! change it only when they differ. The first failing step stops
//! the run and is named in the error. Nothing is rolled back.
//!
//! Steps talk to the machine through the [`Host`] trait, so the
//! same plans run on the local machine ([`LocalHost`]) or on a
//! remote one over SSH ([`SshHost`]).
//!
//! # Examples
//!
//! ## On the instance itself
//!
//! ```sh
//! sudo hoist bootstrap
//! # copy the app into /home/ubuntu/fastapi-app, then
//! sudo hoist deploy
//! sudo hoist tls setup --domain api.example.com --email ops@example.com
//! ```
//!
//! ## From a workstation
//!
//! ```sh
//! hoist --host ubuntu@203.0.113.10 -i ~/.ssh/ec2.pem bootstrap
//! hoist --host ubuntu@203.0.113.10 deploy --dry-run
//! ```
//!
//! ## As a library
//!
//! ```rust,no_run
//! use hoist::{Config, Deployment, LocalHost};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::new("shop-api")
//!         .user("deploy")
//!         .domain("shop.example.com")
//!         .env("ENVIRONMENT", "production");
//!
//!     Deployment::new(&config).deploy(&LocalHost::new())?;
//!     Ok(())
//! }
//! ```

// Allow noisy pedantic lints that don't add value for a
// deployment tool crate.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod bootstrap;
pub mod cmd;
pub mod config;
pub mod deploy;
pub mod error;
pub mod firewall;
pub mod host;
pub mod nginx;
pub mod pipeline;
pub mod reconcile;
pub mod ssh;
pub mod systemd;
pub mod tls;

pub use bootstrap::Bootstrap;
pub use config::Config;
pub use deploy::Deployment;
pub use firewall::RuleSet;
pub use host::{Host, LocalHost, SshHost};
pub use nginx::Site;
pub use pipeline::Pipeline;
pub use systemd::ServiceUnit;
pub use tls::TlsProvisioner;
