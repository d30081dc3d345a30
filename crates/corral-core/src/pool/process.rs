//! Spawning, signalling and reaping worker processes.
//!
//! The pool never calls `fork`, `kill` or `waitpid` directly; it goes through
//! a [`ProcessControl`] so supervision logic can be driven by a scripted
//! implementation in tests.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::error::{Error, Result};
use crate::worker::ExitStatus;

/// Outcome of [`ProcessControl::spawn`], seen from the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawned {
    /// We are the parent; the child has this pid.
    Parent(Pid),
    /// We are the new child process.
    Child,
}

/// OS process operations used by the pool.
pub trait ProcessControl {
    /// Create a child process.
    fn spawn(&mut self) -> Result<Spawned>;

    /// Deliver `signal` to `pid`. A process that is already gone is not an error.
    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()>;

    /// Reap one exited child. Returns `None` when nothing has exited (or, when
    /// `block` is set, when there are no children left to wait for).
    fn wait(&mut self, block: bool) -> Result<Option<ExitStatus>>;
}

/// The real thing: `fork`, `kill` and `waitpid`.
#[derive(Debug, Default)]
pub struct ForkControl;

impl ProcessControl for ForkControl {
    fn spawn(&mut self) -> Result<Spawned> {
        // SAFETY: the pool is single-threaded around fork and the child only
        // runs the worker entry before calling `_exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(Spawned::Parent(child)),
            Ok(ForkResult::Child) => Ok(Spawned::Child),
            Err(errno) => Err(Error::Process(format!("fork failed: {}", errno.desc()))),
        }
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        match signal::kill(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                tracing::debug!(%pid, ?signal, "process already gone");
                Ok(())
            }
            Err(errno) => Err(Error::Process(format!(
                "kill({}, {}) failed: {}",
                pid,
                signal,
                errno.desc()
            ))),
        }
    }

    fn wait(&mut self, block: bool) -> Result<Option<ExitStatus>> {
        let options = (!block).then_some(WaitPidFlag::WNOHANG);
        loop {
            match waitpid(None, options) {
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Some(ExitStatus::exited(pid, code))),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Ok(Some(ExitStatus::signaled(pid, signal)));
                }
                Ok(WaitStatus::StillAlive) => return Ok(None),
                // Stop and continue notifications are not exits.
                Ok(_) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(Errno::EINTR) if !block => continue,
                Err(Errno::EINTR) => return Ok(None),
                Err(errno) => return Err(Error::Process(format!("waitpid failed: {}", errno.desc()))),
            }
        }
    }
}
