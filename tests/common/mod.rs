//! In-memory host used by the procedure tests.
//!
//! Records every command and file write, and emulates just enough
//! of `mkdir`, `ln`, `readlink`, `useradd`, `dpkg-query`, `apt-get`
//! and `ufw` for the reconciliation checks to see their own
//! effects on a second run.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::rc::Rc;

use hoist::cmd::shell_join;
use hoist::error::{DeployError, DeployResult};
use hoist::host::Host;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ufw {
    pub active: bool,
    pub incoming: Option<String>,
    pub outgoing: Option<String>,
    pub rules: Vec<String>,
}

enum Response {
    Output(String),
    Exit(i32),
}

#[derive(Default)]
pub struct FakeHost {
    pub files: RefCell<BTreeMap<String, String>>,
    pub dirs: RefCell<BTreeSet<String>>,
    pub links: RefCell<BTreeMap<String, String>>,
    pub users: RefCell<BTreeSet<String>>,
    pub packages: RefCell<BTreeSet<String>>,
    pub ufw: RefCell<Ufw>,
    pub uid: Cell<u32>,
    pub log: RefCell<Vec<String>>,
    unreadable: RefCell<BTreeSet<String>>,
    responses: RefCell<Vec<(String, Response)>>,
}

impl FakeHost {
    /// A root shell on a fresh machine.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .borrow_mut()
            .insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_uid(self, uid: u32) -> Self {
        self.uid.set(uid);
        self
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn respond(self, prefix: &str, output: &str) -> Self {
        self.responses
            .borrow_mut()
            .push((prefix.to_string(), Response::Output(output.to_string())));
        self
    }

    /// Make commands starting with `prefix` exit with `code`.
    pub fn fail(self, prefix: &str, code: i32) -> Self {
        self.responses
            .borrow_mut()
            .push((prefix.to_string(), Response::Exit(code)));
        self
    }

    /// Make reading `path` fail with an I/O error.
    pub fn unreadable(self, path: &str) -> Self {
        self.unreadable.borrow_mut().insert(path.to_string());
        self
    }

    /// Drop the canned answers for commands starting with `prefix`.
    pub fn forget(&self, prefix: &str) {
        self.responses.borrow_mut().retain(|(p, _)| p != prefix);
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    /// Logged commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.log.borrow().iter().position(|c| c.starts_with(prefix))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    fn failed(line: &str, code: i32) -> DeployError {
        DeployError::CommandFailed {
            command: line.to_string(),
            status: ExitStatus::from_raw(code << 8),
        }
    }

    fn emulate(&self, line: &str, program: &str, args: &[&str]) -> DeployResult<String> {
        let last = args.last().copied().unwrap_or_default();
        match program {
            "id" if args == ["-u"] => Ok(self.uid.get().to_string()),
            "id" => {
                if self.users.borrow().contains(last) {
                    Ok(format!("uid=1000({last})"))
                } else {
                    Err(Self::failed(line, 1))
                }
            }
            "useradd" => {
                self.users.borrow_mut().insert(last.to_string());
                Ok(String::new())
            }
            "mkdir" => {
                let mut dirs = self.dirs.borrow_mut();
                if args.first() != Some(&"-p") && dirs.contains(last) {
                    return Err(Self::failed(line, 1));
                }
                dirs.insert(last.to_string());
                Ok(String::new())
            }
            "rmdir" => {
                self.dirs.borrow_mut().remove(last);
                Ok(String::new())
            }
            "readlink" => self
                .links
                .borrow()
                .get(last)
                .cloned()
                .ok_or_else(|| Self::failed(line, 1)),
            "ln" => {
                self.links
                    .borrow_mut()
                    .insert(args[2].to_string(), args[1].to_string());
                Ok(String::new())
            }
            "rm" => {
                self.files.borrow_mut().remove(last);
                self.links.borrow_mut().remove(last);
                if args.first() == Some(&"-rf") {
                    let inside = format!("{last}/");
                    self.files.borrow_mut().retain(|p, _| !p.starts_with(&inside));
                    self.dirs.borrow_mut().remove(last);
                }
                Ok(String::new())
            }
            "dpkg-query" => {
                if self.packages.borrow().contains(last) {
                    Ok("install ok installed".to_string())
                } else {
                    Err(Self::failed(line, 1))
                }
            }
            "env" if args.contains(&"install") => {
                let mut packages = self.packages.borrow_mut();
                for p in args.iter().skip_while(|a| **a != "-q").skip(1) {
                    packages.insert((*p).to_string());
                }
                Ok(String::new())
            }
            "ufw" => Ok(self.emulate_ufw(args)),
            _ => Ok(String::new()),
        }
    }

    fn emulate_ufw(&self, args: &[&str]) -> String {
        let mut ufw = self.ufw.borrow_mut();
        match args {
            ["status", "verbose"] => {
                if !ufw.active {
                    return "Status: inactive".to_string();
                }
                format!(
                    "Status: active\nLogging: on (low)\nDefault: {} (incoming), {} (outgoing), disabled (routed)\n",
                    ufw.incoming.as_deref().unwrap_or("deny"),
                    ufw.outgoing.as_deref().unwrap_or("allow"),
                )
            }
            ["show", "added"] => {
                let mut out = "Added user rules (see 'ufw status' for running firewall):".to_string();
                for rule in &ufw.rules {
                    out.push_str(&format!("\nufw allow {rule}"));
                }
                out
            }
            ["default", policy, "incoming"] => {
                ufw.incoming = Some((*policy).to_string());
                String::new()
            }
            ["default", policy, "outgoing"] => {
                ufw.outgoing = Some((*policy).to_string());
                String::new()
            }
            ["allow", rule] => {
                if !ufw.rules.iter().any(|r| r == rule) {
                    ufw.rules.push((*rule).to_string());
                }
                String::new()
            }
            ["--force", "enable"] => {
                ufw.active = true;
                String::new()
            }
            _ => String::new(),
        }
    }
}

impl Host for FakeHost {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn run(&self, program: &str, args: &[&str]) -> DeployResult<String> {
        let line = shell_join(program, args);
        self.log.borrow_mut().push(line.clone());

        for (prefix, response) in self.responses.borrow().iter() {
            if line.starts_with(prefix.as_str()) {
                return match response {
                    Response::Output(out) => Ok(out.clone()),
                    Response::Exit(code) => Err(Self::failed(&line, *code)),
                };
            }
        }

        self.emulate(&line, program, args)
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> DeployResult<()> {
        self.run(program, args).map(|_| ())
    }

    fn read_file(&self, path: &str) -> DeployResult<Option<String>> {
        if self.unreadable.borrow().contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, path.to_string()).into());
        }
        Ok(self.files.borrow().get(path).cloned())
    }

    fn write_file(&self, path: &str, content: &str, _mode: u32) -> DeployResult<()> {
        self.log.borrow_mut().push(format!("write {path}"));
        self.files
            .borrow_mut()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn exists(&self, path: &str) -> DeployResult<bool> {
        Ok(self.files.borrow().contains_key(path)
            || self.dirs.borrow().contains(path)
            || self.links.borrow().contains_key(path))
    }
}

/// A [`FakeHost`] that can be handed over by value (to a
/// `Pipeline`) while the test keeps inspecting it.
pub struct SharedHost(pub Rc<FakeHost>);

impl Host for SharedHost {
    fn name(&self) -> String {
        self.0.name()
    }

    fn run(&self, program: &str, args: &[&str]) -> DeployResult<String> {
        self.0.run(program, args)
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> DeployResult<()> {
        self.0.run_interactive(program, args)
    }

    fn read_file(&self, path: &str) -> DeployResult<Option<String>> {
        self.0.read_file(path)
    }

    fn write_file(&self, path: &str, content: &str, mode: u32) -> DeployResult<()> {
        self.0.write_file(path, content, mode)
    }

    fn exists(&self, path: &str) -> DeployResult<bool> {
        self.0.exists(path)
    }
}
