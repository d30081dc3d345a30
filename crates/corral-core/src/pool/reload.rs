//! Rolling restart bookkeeping.
//!
//! A reload stops the workers that were running when it began, one at a
//! time: SIGTERM, wait for the exit (the pool respawns the slot), then the
//! next. A worker that ignores SIGTERM past the timeout gets one SIGKILL.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use rustc_hash::FxHashMap;

use crate::worker::WorkerTable;

use super::process::ProcessControl;

#[derive(Debug, Clone, Copy)]
struct ReloadTimer {
    deadline: Instant,
    fired: bool,
}

/// Workers still to be restarted by an in-progress reload.
#[derive(Debug)]
pub struct ReloadTask {
    pending: FxHashMap<Pid, usize>,
    kill_queue: VecDeque<Pid>,
    in_flight: Option<Pid>,
    timer: Option<ReloadTimer>,
    timeout: Duration,
}

impl ReloadTask {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: FxHashMap::default(),
            kill_queue: VecDeque::new(),
            in_flight: None,
            timer: None,
            timeout,
        }
    }

    /// Enrol workers in the order they should be restarted.
    pub fn add_workers(&mut self, workers: impl IntoIterator<Item = (Pid, usize)>) {
        for (pid, slot) in workers {
            if self.pending.insert(pid, slot).is_none() {
                self.kill_queue.push_back(pid);
            }
        }
    }

    /// Workers not yet observed to exit.
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_completed(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn exists(&self, pid: Pid) -> bool {
        self.pending.contains_key(&pid)
    }

    /// The worker signalled last and not yet reaped.
    pub fn in_flight(&self) -> Option<Pid> {
        self.in_flight
    }

    /// SIGTERM the next pending worker and arm the timer.
    ///
    /// Does nothing while a previous worker is still on its way out.
    pub fn kill_one(
        &mut self,
        control: &mut dyn ProcessControl,
        table: &WorkerTable,
        now: Instant,
    ) -> Option<Pid> {
        if self.in_flight.is_some() {
            return None;
        }
        while let Some(pid) = self.kill_queue.pop_front() {
            let Some(&slot) = self.pending.get(&pid) else {
                continue;
            };
            if let Some(worker) = table.slot(slot) {
                worker.mark_exiting();
            }
            if let Err(e) = control.kill(pid, Signal::SIGTERM) {
                tracing::warn!(%pid, "reload: failed to signal worker: {}", e);
            }
            tracing::info!(%pid, slot, remaining = self.pending.len(), "reload: stopping worker");
            self.in_flight = Some(pid);
            self.timer = Some(ReloadTimer {
                deadline: now + self.timeout,
                fired: false,
            });
            return Some(pid);
        }
        None
    }

    /// Escalate to SIGKILL once the armed timer has expired. Fires at most
    /// once per arming; returns whether it fired now.
    pub fn check_timeout(&mut self, control: &mut dyn ProcessControl, now: Instant) -> bool {
        let Some(timer) = self.timer.as_mut() else {
            return false;
        };
        if timer.fired || now < timer.deadline {
            return false;
        }
        timer.fired = true;
        if let Some(pid) = self.in_flight {
            tracing::warn!(%pid, timeout = ?self.timeout, "reload: worker ignored SIGTERM, killing");
            if let Err(e) = control.kill(pid, Signal::SIGKILL) {
                tracing::warn!(%pid, "reload: failed to kill worker: {}", e);
            }
        }
        true
    }

    /// Signal every pending worker at once. Used when the master shuts down
    /// in the middle of a reload.
    pub fn kill_all(&mut self, control: &mut dyn ProcessControl, signal: Signal) {
        for &pid in self.pending.keys() {
            if let Err(e) = control.kill(pid, signal) {
                tracing::warn!(%pid, "reload: failed to signal worker: {}", e);
            }
        }
        self.kill_queue.clear();
        self.timer = None;
    }

    /// Forget an exited worker. Returns true if it belonged to this reload.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let removed = self.pending.remove(&pid).is_some();
        if self.in_flight == Some(pid) {
            self.in_flight = None;
            self.timer = None;
        }
        removed
    }
}
