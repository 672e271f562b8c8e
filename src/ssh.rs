use crate::cmd;
use crate::error::{DeployError, DeployResult};

/// SSH session wrapper for executing commands and writing files
/// on a remote host.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    user: String,
    key: Option<String>,
}

impl SshSession {
    #[must_use]
    pub fn new(host: &str, user: &str) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            key: None,
        }
    }

    /// Parse a `user@host` target. Without a user part the
    /// login defaults to `ubuntu`, the stock EC2 account.
    #[must_use]
    pub fn parse(target: &str) -> Self {
        match target.split_once('@') {
            Some((user, host)) if !user.is_empty() => Self::new(host, user),
            Some((_, host)) => Self::new(host, "ubuntu"),
            None => Self::new(target, "ubuntu"),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key_path: &str) -> Self {
        self.key = Some(key_path.to_string());
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Execute a command on the remote host and capture output.
    pub fn exec(&self, command: &str) -> DeployResult<String> {
        let args = self.build_ssh_args(command);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("ssh", &refs)
    }

    /// Execute a command on the remote host interactively.
    pub fn exec_interactive(&self, command: &str) -> DeployResult<()> {
        let mut args = vec!["-t".to_string()];
        args.extend(self.build_ssh_args(command));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run_interactive("ssh", &refs)
    }

    /// Execute a command on the remote host, feeding `input` to
    /// its stdin.
    pub fn exec_with_stdin(&self, command: &str, input: &[u8]) -> DeployResult<String> {
        let args = self.build_ssh_args(command);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run_with_stdin("ssh", &refs, input)
    }

    /// Open a throwaway connection to fail early on bad
    /// addresses or keys.
    pub fn check(&self) -> DeployResult<()> {
        self.exec("true").map_err(|e| {
            DeployError::SshFailed(format!("{}: {e}", self.destination()))
        })?;
        Ok(())
    }

    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.ssh_base_args();
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    fn ssh_base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }
}
