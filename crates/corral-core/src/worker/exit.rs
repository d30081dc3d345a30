//! Decoded process exit status.

use std::fmt;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// How a child process ended, as reported by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pid: Pid,
    status: i32,
}

impl ExitStatus {
    /// Wrap a raw `waitpid` status word.
    pub fn from_raw(pid: Pid, status: i32) -> Self {
        Self { pid, status }
    }

    /// Status of a process that called `exit(code)`.
    pub fn exited(pid: Pid, code: i32) -> Self {
        Self::from_raw(pid, (code & 0xff) << 8)
    }

    /// Status of a process terminated by `signal`.
    pub fn signaled(pid: Pid, signal: Signal) -> Self {
        Self::from_raw(pid, signal as i32 & 0x7f)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The raw status word.
    pub fn raw(&self) -> i32 {
        self.status
    }

    /// Whether the process exited on its own rather than by a signal.
    pub fn is_normal_exit(&self) -> bool {
        libc::WIFEXITED(self.status)
    }

    /// Exit code; meaningful when [`is_normal_exit`](Self::is_normal_exit).
    pub fn code(&self) -> i32 {
        libc::WEXITSTATUS(self.status)
    }

    /// Terminating signal number, if the process was killed by one.
    pub fn signal_number(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.status).then(|| libc::WTERMSIG(self.status))
    }

    pub fn signal(&self) -> Option<Signal> {
        self.signal_number().and_then(|n| Signal::try_from(n).ok())
    }

    /// Clean `exit(0)`.
    pub fn is_success(&self) -> bool {
        self.is_normal_exit() && self.code() == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal_number() {
            Some(signo) => match self.signal() {
                Some(signal) => write!(f, "pid {} killed by {}", self.pid, signal),
                None => write!(f, "pid {} killed by signal {}", self.pid, signo),
            },
            None => write!(f, "pid {} exited with code {}", self.pid, self.code()),
        }
    }
}
