use std::process::{Command, Output, Stdio};

use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

/// Run a command and capture its output. Fails if the command
/// returns a non-zero exit code.
pub fn run(program: &str, args: &[&str]) -> DeployResult<String> {
    debug!(command = %shell_join(program, args), "exec");
    let output = spawn(program, args)?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!("{program}: {stderr}");
        }
        Err(DeployError::CommandFailed {
            command: shell_join(program, args),
            status: output.status,
        })
    }
}

/// Run a command with stdin/stdout/stderr inherited (interactive).
pub fn run_interactive(program: &str, args: &[&str]) -> DeployResult<()> {
    debug!(command = %shell_join(program, args), "exec (interactive)");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| not_found_or_io(program, e))?;

    if status.success() {
        Ok(())
    } else {
        Err(DeployError::CommandFailed {
            command: shell_join(program, args),
            status,
        })
    }
}

/// Run a command that pipes its stdin from a byte slice.
pub fn run_with_stdin(program: &str, args: &[&str], stdin_data: &[u8]) -> DeployResult<String> {
    use std::io::Write;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| not_found_or_io(program, e))?;

    if let Some(stdin) = &mut child.stdin {
        stdin.write_all(stdin_data)?;
    }
    drop(child.stdin.take());

    let output = child.wait_with_output()?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!("{program}: {stderr}");
        }
        Err(DeployError::CommandFailed {
            command: shell_join(program, args),
            status: output.status,
        })
    }
}

/// Check if a command exists on PATH.
#[must_use]
pub fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Quote a single argument for a POSIX shell. Plain words are
/// left alone so logged commands stay readable.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Join a program and its arguments into one shell command line.
#[must_use]
pub fn shell_join(program: &str, args: &[&str]) -> String {
    let mut parts = vec![shell_quote(program)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn spawn(program: &str, args: &[&str]) -> DeployResult<Output> {
    Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| not_found_or_io(program, e))
}

fn not_found_or_io(program: &str, e: std::io::Error) -> DeployError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DeployError::CommandNotFound(program.to_string())
    } else {
        DeployError::Io(e)
    }
}
