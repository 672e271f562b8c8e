//! Step pipeline and the idempotent primitives steps are built
//! from.
//!
//! A [`Plan`] is an ordered list of named steps. Running it stops
//! at the first error and wraps it in
//! [`DeployError::StepFailed`] so the operator sees which step
//! broke. Nothing is rolled back.

use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};
use crate::host::Host;

/// Result of reconciling one piece of host state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    Unchanged,
}

impl Outcome {
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Changed)
    }

    /// `Changed` if either side changed.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        if self.changed() || other.changed() {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Changed => f.write_str("changed"),
            Self::Unchanged => f.write_str("ok"),
        }
    }
}

type Action<'a> = Box<dyn Fn(&dyn Host) -> DeployResult<Outcome> + 'a>;

struct Step<'a> {
    name: &'static str,
    action: Action<'a>,
}

/// Ordered, fail-fast list of named steps.
#[derive(Default)]
pub struct Plan<'a> {
    steps: Vec<Step<'a>>,
}

impl<'a> Plan<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    #[must_use]
    pub fn step(
        mut self,
        name: &'static str,
        action: impl Fn(&dyn Host) -> DeployResult<Outcome> + 'a,
    ) -> Self {
        self.steps.push(Step {
            name,
            action: Box::new(action),
        });
        self
    }

    /// Step names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// Run every step in order, halting on the first failure.
    pub fn run(&self, host: &dyn Host) -> DeployResult<Report> {
        let total = self.steps.len();
        let mut report = Report::default();

        for (i, step) in self.steps.iter().enumerate() {
            info!("[{}/{total}] {}", i + 1, step.name);
            match (step.action)(host) {
                Ok(outcome) => {
                    info!("[{}/{total}] {}: {outcome}", i + 1, step.name);
                    report.entries.push((step.name, outcome));
                }
                Err(e) => {
                    return Err(DeployError::StepFailed {
                        step: step.name.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(report)
    }
}

/// What each step did.
#[derive(Debug, Default, Clone)]
pub struct Report {
    pub entries: Vec<(&'static str, Outcome)>,
}

impl Report {
    /// Number of steps that changed the host.
    #[must_use]
    pub fn changed(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.changed()).count()
    }

    #[must_use]
    pub fn outcome(&self, step: &str) -> Option<Outcome> {
        self.entries
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, o)| *o)
    }
}

/// Fail unless commands on the host run with uid 0.
pub fn require_root(host: &dyn Host) -> DeployResult<Outcome> {
    let uid = host.run("id", &["-u"])?;
    if uid.trim() == "0" {
        Ok(Outcome::Unchanged)
    } else {
        Err(DeployError::NotRoot(host.name()))
    }
}

/// Write `content` to `path` unless it already holds it.
/// Surrounding whitespace is ignored when comparing.
pub fn ensure_file(
    host: &dyn Host,
    path: &str,
    content: &str,
    mode: u32,
) -> DeployResult<Outcome> {
    if let Some(current) = host.read_file(path)? {
        if current.trim() == content.trim() {
            return Ok(Outcome::Unchanged);
        }
    }
    info!("writing {path}");
    host.write_file(path, content, mode)?;
    Ok(Outcome::Changed)
}

/// Create a directory (and parents) if missing, handing it to
/// `owner` on creation.
pub fn ensure_dir(host: &dyn Host, path: &str, owner: Option<&str>) -> DeployResult<Outcome> {
    if host.exists(path)? {
        return Ok(Outcome::Unchanged);
    }
    info!("creating {path}");
    host.run("mkdir", &["-p", path])?;
    if let Some(owner) = owner {
        let ownership = format!("{owner}:{owner}");
        host.run("chown", &["-R", &ownership, path])?;
    }
    Ok(Outcome::Changed)
}

/// Point `link` at `target`, replacing a link that points
/// elsewhere.
pub fn ensure_symlink(host: &dyn Host, target: &str, link: &str) -> DeployResult<Outcome> {
    match host.run("readlink", &[link]) {
        Ok(current) if current.trim() == target => return Ok(Outcome::Unchanged),
        Ok(_) | Err(DeployError::CommandFailed { .. }) => {}
        Err(e) => return Err(e),
    }
    info!("linking {link} -> {target}");
    host.run("ln", &["-sfn", target, link])?;
    Ok(Outcome::Changed)
}

/// Remove `path` if present.
pub fn ensure_absent(host: &dyn Host, path: &str) -> DeployResult<Outcome> {
    if !host.exists(path)? {
        return Ok(Outcome::Unchanged);
    }
    info!("removing {path}");
    host.run("rm", &["-f", path])?;
    Ok(Outcome::Changed)
}

/// The `hoist` process holding a [`HostLock`]: the machine it runs
/// on and its pid there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub machine: String,
    pub pid: u32,
}

impl LockOwner {
    /// This process.
    #[must_use]
    pub fn current() -> Self {
        let machine = cmd::run("hostname", &[])
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            machine,
            pid: std::process::id(),
        }
    }

    /// Parse the `<machine> <pid>` line stored in the lock.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (machine, pid) = text.trim().rsplit_once(' ')?;
        Some(Self {
            machine: machine.trim().to_string(),
            pid: pid.parse().ok()?,
        })
    }

    /// Whether this holder is known to be gone. Only holders on the
    /// caller's own machine can be checked.
    fn is_stale_for(&self, caller: &Self) -> bool {
        self.machine == caller.machine && !process_alive(self.pid)
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.machine, self.pid)
    }
}

fn process_alive(pid: u32) -> bool {
    if Path::new("/proc/self").exists() {
        return Path::new(&format!("/proc/{pid}")).exists();
    }
    cmd::run("kill", &["-0", &pid.to_string()]).is_ok()
}

/// Host-wide mutual exclusion between concurrent `hoist` runs.
///
/// Taken with an atomic `mkdir`, which also records the owner
/// inside the directory. Released on drop. A lock left behind by a
/// killed run on this machine is taken over; one held from another
/// machine has to be removed by hand.
pub struct HostLock<'a> {
    host: &'a dyn Host,
    path: String,
}

impl<'a> HostLock<'a> {
    pub fn acquire(host: &'a dyn Host, path: &str) -> DeployResult<Self> {
        Self::acquire_as(host, path, &LockOwner::current())
    }

    /// Take the lock on behalf of `owner`.
    pub fn acquire_as(host: &'a dyn Host, path: &str, owner: &LockOwner) -> DeployResult<Self> {
        if !Self::try_mkdir(host, path)? {
            let holder = host
                .read_file(&owner_file(path))?
                .as_deref()
                .and_then(LockOwner::parse);
            match holder {
                Some(holder) if holder.is_stale_for(owner) => {
                    warn!("taking over lock {path} left by dead process {holder}");
                    host.run("rm", &["-rf", path])?;
                    if !Self::try_mkdir(host, path)? {
                        return Err(DeployError::Locked(path.to_string()));
                    }
                }
                Some(holder) => {
                    return Err(DeployError::Locked(format!("{path} (held by {holder})")));
                }
                None => return Err(DeployError::Locked(path.to_string())),
            }
        }

        let lock = Self {
            host,
            path: path.to_string(),
        };
        host.write_file(&owner_file(path), &format!("{owner}\n"), 0o644)?;
        Ok(lock)
    }

    fn try_mkdir(host: &dyn Host, path: &str) -> DeployResult<bool> {
        match host.run("mkdir", &[path]) {
            Ok(_) => Ok(true),
            Err(DeployError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn owner_file(path: &str) -> String {
    format!("{path}/owner")
}

impl Drop for HostLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.host.run("rm", &["-rf", &self.path]) {
            warn!("could not release lock {}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::host::LocalHost;

    #[test]
    fn outcome_combines() {
        assert_eq!(Outcome::Unchanged.and(Outcome::Unchanged), Outcome::Unchanged);
        assert_eq!(Outcome::Unchanged.and(Outcome::Changed), Outcome::Changed);
        assert_eq!(Outcome::Changed.to_string(), "changed");
        assert_eq!(Outcome::Unchanged.to_string(), "ok");
    }

    #[test]
    fn plan_reports_each_step() {
        let report = Plan::new()
            .step("one", |_| Ok(Outcome::Changed))
            .step("two", |_| Ok(Outcome::Unchanged))
            .run(&LocalHost::new())
            .unwrap();

        assert_eq!(report.changed(), 1);
        assert_eq!(report.outcome("two"), Some(Outcome::Unchanged));
        assert_eq!(report.outcome("three"), None);
    }

    #[test]
    fn plan_stops_at_first_failure() {
        let ran = Cell::new(0);
        let err = Plan::new()
            .step("first", |_| {
                ran.set(ran.get() + 1);
                Ok(Outcome::Unchanged)
            })
            .step("broken", |_| Err(DeployError::Other("boom".into())))
            .step("never", |_| {
                ran.set(ran.get() + 10);
                Ok(Outcome::Changed)
            })
            .run(&LocalHost::new())
            .unwrap_err();

        assert_eq!(ran.get(), 1);
        assert_eq!(err.failed_step(), Some("broken"));
        assert_eq!(err.root().to_string(), "boom");
    }
}
