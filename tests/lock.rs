mod common;

use common::FakeHost;
use hoist::error::DeployError;
use hoist::reconcile::{HostLock, LockOwner};

const LOCK: &str = "/run/lock/hoist-fastapi-app.lock";
const OWNER: &str = "/run/lock/hoist-fastapi-app.lock/owner";

fn owner(machine: &str, pid: u32) -> LockOwner {
    LockOwner {
        machine: machine.to_string(),
        pid,
    }
}

#[test]
fn records_owner_and_releases_on_drop() {
    let host = FakeHost::new();
    let me = owner("ci-box", std::process::id());

    let lock = HostLock::acquire_as(&host, LOCK, &me).unwrap();
    assert_eq!(
        host.file(OWNER).as_deref().and_then(LockOwner::parse),
        Some(me)
    );

    drop(lock);
    assert!(!host.dirs.borrow().contains(LOCK));
    assert!(host.file(OWNER).is_none());
}

#[test]
fn dead_holder_on_same_machine_is_taken_over() {
    let host = FakeHost::new();
    let killed = owner("ci-box", 4_000_000_000);
    let me = owner("ci-box", std::process::id());

    std::mem::forget(HostLock::acquire_as(&host, LOCK, &killed).unwrap());
    let _lock = HostLock::acquire_as(&host, LOCK, &me).unwrap();

    assert_eq!(host.count(&format!("rm -rf {LOCK}")), 1);
    assert_eq!(
        host.file(OWNER).as_deref().and_then(LockOwner::parse),
        Some(me)
    );
}

#[test]
fn live_holder_keeps_lock() {
    let host = FakeHost::new();
    let holder = owner("ci-box", std::process::id());

    let _held = HostLock::acquire_as(&host, LOCK, &holder).unwrap();
    match HostLock::acquire_as(&host, LOCK, &owner("ci-box", 1)) {
        Err(DeployError::Locked(msg)) => {
            assert!(msg.contains(&format!("held by ci-box {}", std::process::id())));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("lock acquired twice"),
    }
}

#[test]
fn holder_on_other_machine_is_never_taken_over() {
    let host = FakeHost::new();
    let remote = owner("workstation", 4_000_000_000);

    std::mem::forget(HostLock::acquire_as(&host, LOCK, &remote).unwrap());

    assert!(matches!(
        HostLock::acquire_as(&host, LOCK, &owner("ci-box", std::process::id())),
        Err(DeployError::Locked(_))
    ));
    assert_eq!(host.count("rm -rf"), 0);
}

#[test]
fn lock_without_owner_is_left_alone() {
    let host = FakeHost::new();
    host.dirs.borrow_mut().insert(LOCK.to_string());

    match HostLock::acquire_as(&host, LOCK, &owner("ci-box", std::process::id())) {
        Err(DeployError::Locked(path)) => assert_eq!(path, LOCK),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("lock acquired over an unknown holder"),
    }
}

#[test]
fn owner_line_parses() {
    assert_eq!(
        LockOwner::parse("ip-10-0-0-5 1234\n"),
        Some(owner("ip-10-0-0-5", 1234))
    );
    assert_eq!(LockOwner::parse("garbage"), None);
    assert_eq!(LockOwner::parse("host notapid"), None);
}
