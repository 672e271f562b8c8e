//! Targets that procedures run against.
//!
//! Every step talks to the machine through [`Host`], so the same
//! bootstrap/deploy/TLS logic works on the local machine (the
//! usual case: run `hoist` on the instance itself) or on a remote
//! one over SSH.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::cmd;
use crate::error::{DeployError, DeployResult};
use crate::ssh::SshSession;

/// A machine whose state the procedures reconcile.
pub trait Host {
    /// Name used in log lines.
    fn name(&self) -> String;

    /// Run a command and capture stdout. A non-zero exit is
    /// [`DeployError::CommandFailed`].
    fn run(&self, program: &str, args: &[&str]) -> DeployResult<String>;

    /// Run a command with its output streamed to the operator.
    fn run_interactive(&self, program: &str, args: &[&str]) -> DeployResult<()>;

    /// Read a file, `None` when it does not exist.
    fn read_file(&self, path: &str) -> DeployResult<Option<String>>;

    /// Replace a file atomically: the new content is written to
    /// a sibling temp file and renamed over `path`.
    fn write_file(&self, path: &str, content: &str, mode: u32) -> DeployResult<()>;

    /// Whether `path` exists (dangling symlinks count).
    fn exists(&self, path: &str) -> DeployResult<bool>;

    /// Run a check command, mapping a non-zero exit to `false`.
    fn succeeds(&self, program: &str, args: &[&str]) -> DeployResult<bool> {
        match self.run(program, args) {
            Ok(_) => Ok(true),
            Err(DeployError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run a command as another (unprivileged) account.
    fn run_as(&self, user: &str, program: &str, args: &[&str]) -> DeployResult<String> {
        let mut full = vec!["-u", user, "-H", program];
        full.extend_from_slice(args);
        self.run("sudo", &full)
    }
}

/// The machine `hoist` itself runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl LocalHost {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Host for LocalHost {
    fn name(&self) -> String {
        "localhost".to_string()
    }

    fn run(&self, program: &str, args: &[&str]) -> DeployResult<String> {
        cmd::run(program, args)
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> DeployResult<()> {
        cmd::run_interactive(program, args)
    }

    fn read_file(&self, path: &str) -> DeployResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, path: &str, content: &str, mode: u32) -> DeployResult<()> {
        let target = Path::new(path);
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeployError::Other(format!("not a file path: {path}")))?;
        let tmp = target.with_file_name(format!(".{file_name}.hoist-tmp"));

        fs::write(&tmp, content)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        fs::rename(&tmp, target)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> DeployResult<bool> {
        Ok(fs::symlink_metadata(path).is_ok())
    }
}

/// A remote machine reached over SSH. Commands are wrapped in
/// `sudo -n` unless the login user is already root.
#[derive(Debug, Clone)]
pub struct SshHost {
    session: SshSession,
    sudo: bool,
}

impl SshHost {
    #[must_use]
    pub fn new(session: SshSession) -> Self {
        let sudo = session.user() != "root";
        Self { session, sudo }
    }

    #[must_use]
    pub const fn session(&self) -> &SshSession {
        &self.session
    }

    fn command_line(&self, program: &str, args: &[&str]) -> String {
        let line = cmd::shell_join(program, args);
        if self.sudo {
            format!("sudo -n {line}")
        } else {
            line
        }
    }
}

impl Host for SshHost {
    fn name(&self) -> String {
        self.session.destination()
    }

    fn run(&self, program: &str, args: &[&str]) -> DeployResult<String> {
        self.session.exec(&self.command_line(program, args))
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> DeployResult<()> {
        self.session
            .exec_interactive(&self.command_line(program, args))
    }

    fn read_file(&self, path: &str) -> DeployResult<Option<String>> {
        if !self.exists(path)? {
            return Ok(None);
        }
        self.run("cat", &[path]).map(Some)
    }

    fn write_file(&self, path: &str, content: &str, mode: u32) -> DeployResult<()> {
        let tmp = format!("{path}.hoist-tmp");
        let script = format!(
            "cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {path}",
            tmp = cmd::shell_quote(&tmp),
            path = cmd::shell_quote(path),
        );
        let line = self.command_line("sh", &["-c", &script]);
        self.session.exec_with_stdin(&line, content.as_bytes())?;
        Ok(())
    }

    fn exists(&self, path: &str) -> DeployResult<bool> {
        self.succeeds("sh", &["-c", &format!("test -e {0} || test -L {0}", cmd::shell_quote(path))])
    }
}
