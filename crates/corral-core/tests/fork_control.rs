//! Integration tests for the real process backend.
//!
//! Both tests share one function so no other test in this binary can reap
//! their children.

use std::thread;
use std::time::Duration;

use corral_core::{ForkControl, ProcessControl, Spawned};
use nix::sys::signal::Signal;

#[test]
fn test_spawn_kill_and_reap() {
    let mut control = ForkControl;

    // A child that exits on its own.
    let pid = match control.spawn().unwrap() {
        Spawned::Child => unsafe { libc::_exit(7) },
        Spawned::Parent(pid) => pid,
    };
    let status = control.wait(true).unwrap().expect("child reaped");
    assert_eq!(status.pid(), pid);
    assert!(status.is_normal_exit());
    assert_eq!(status.code(), 7);
    assert!(!status.is_success());

    // A child that has to be told to stop.
    let pid = match control.spawn().unwrap() {
        Spawned::Child => loop {
            thread::sleep(Duration::from_secs(1));
        },
        Spawned::Parent(pid) => pid,
    };
    assert_eq!(control.wait(false).unwrap(), None);
    control.kill(pid, Signal::SIGTERM).unwrap();
    let status = control.wait(true).unwrap().expect("child reaped");
    assert_eq!(status.pid(), pid);
    assert_eq!(status.signal(), Some(Signal::SIGTERM));

    // Nothing left: blocking wait reports no children instead of hanging.
    assert_eq!(control.wait(true).unwrap(), None);
    // Signalling a reaped pid is not an error.
    control.kill(pid, Signal::SIGTERM).unwrap();
}
