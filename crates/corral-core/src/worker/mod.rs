//! Worker descriptors.
//!
//! A [`Worker`] is the part of a worker's state every process can see: it
//! lives in a table mapped into shared memory before the first fork, so the
//! master reads status and counters that the worker process writes. All
//! mutable fields are atomics.
//!
//! Identity that never changes after spawn is captured once per process as
//! a [`WorkerIdentity`] snapshot and passed around by value.

mod context;
mod exit;
mod runtime;

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::Pid;
use rand::Rng;

use crate::error::{Error, Result};
use crate::shm::SharedSlice;

pub use context::{ProcessRole, Responder, WorkerContext};
pub use exit::ExitStatus;
pub use runtime::WorkerRuntime;
pub(crate) use runtime::redirect_stdio;

/// Logical worker id (`start_id + slot`).
pub type WorkerId = u32;

/// Lifecycle of a worker slot as the master sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Slot reset, process not yet forked.
    Spawning = 1,
    Idle = 2,
    Busy = 3,
    /// Asked to stop; never dispatched to again.
    Exiting = 4,
    /// Process exit observed; the slot waits for a respawn.
    Reaped = 5,
    /// The process gave up its slot and finishes on its own; the master
    /// starts a replacement without waiting for it to exit.
    Detached = 6,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Spawning,
            2 => WorkerStatus::Idle,
            3 => WorkerStatus::Busy,
            4 => WorkerStatus::Exiting,
            6 => WorkerStatus::Detached,
            _ => WorkerStatus::Reaped,
        }
    }
}

/// Shared, externally synchronised state of one worker slot.
#[repr(C)]
pub struct Worker {
    id: WorkerId,
    shared: bool,
    pid: AtomicI32,
    status: AtomicU8,
    generation: AtomicU32,
    start_time: AtomicI64,
    exit_time: AtomicI64,
    max_request: AtomicU32,
    dispatch_count: AtomicU64,
    request_count: AtomicU64,
    response_count: AtomicU64,
    concurrency: AtomicU32,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Worker {
    fn new(id: WorkerId, shared: bool) -> Self {
        Self {
            id,
            shared,
            pid: AtomicI32::new(0),
            status: AtomicU8::new(WorkerStatus::Reaped as u8),
            generation: AtomicU32::new(0),
            start_time: AtomicI64::new(0),
            exit_time: AtomicI64::new(0),
            max_request: AtomicU32::new(0),
            dispatch_count: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            concurrency: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether this descriptor lives in memory shared with other processes.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Process id, or `None` while no process occupies the slot.
    pub fn pid(&self) -> Option<Pid> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.status() == WorkerStatus::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.status() == WorkerStatus::Busy
    }

    pub fn is_exiting(&self) -> bool {
        self.status() == WorkerStatus::Exiting
    }

    pub fn is_detached(&self) -> bool {
        self.status() == WorkerStatus::Detached
    }

    fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle -> Busy. Fails if the worker is in any other state.
    pub fn try_mark_busy(&self) -> bool {
        self.transition(WorkerStatus::Idle, WorkerStatus::Busy)
    }

    /// Busy -> Idle once a task and its reply are done.
    ///
    /// A worker that was moved to Exiting meanwhile stays Exiting.
    pub fn mark_idle(&self) -> bool {
        self.transition(WorkerStatus::Busy, WorkerStatus::Idle)
    }

    /// Idle or Busy -> Detached. Fails once the worker is exiting, so a stop
    /// already in flight wins over a detach.
    pub fn mark_detached(&self) -> bool {
        self.transition(WorkerStatus::Busy, WorkerStatus::Detached)
            || self.transition(WorkerStatus::Idle, WorkerStatus::Detached)
    }

    /// Any live state -> Exiting. Returns false if already Exiting or Reaped.
    pub fn mark_exiting(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            match WorkerStatus::from_u8(current) {
                WorkerStatus::Exiting | WorkerStatus::Reaped => return false,
                _ => {}
            }
            match self.status.compare_exchange(
                current,
                WorkerStatus::Exiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the scheduler may pick this worker.
    pub fn is_dispatchable(&self) -> bool {
        self.is_idle() && !self.has_exceeded_max_request()
    }

    /// Reset the slot ahead of a (re)spawn.
    pub(crate) fn reset(&self) {
        self.pid.store(0, Ordering::Release);
        self.dispatch_count.store(0, Ordering::Relaxed);
        self.request_count.store(0, Ordering::Relaxed);
        self.response_count.store(0, Ordering::Relaxed);
        self.concurrency.store(0, Ordering::Relaxed);
        self.exit_time.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_status(WorkerStatus::Spawning);
    }

    /// Record a freshly forked process; the worker becomes dispatchable.
    pub(crate) fn attach(&self, pid: Pid) {
        self.pid.store(pid.as_raw(), Ordering::Release);
        self.start_time.store(unix_now(), Ordering::Relaxed);
        self.set_status(WorkerStatus::Idle);
    }

    /// Record an observed exit.
    pub(crate) fn mark_reaped(&self) {
        self.pid.store(0, Ordering::Release);
        self.exit_time.store(unix_now(), Ordering::Relaxed);
        self.set_status(WorkerStatus::Reaped);
    }

    /// Times this slot has been given a process.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Unix seconds when the current process was attached.
    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::Relaxed)
    }

    /// Unix seconds when the last process exit was observed.
    pub fn exit_time(&self) -> i64 {
        self.exit_time.load(Ordering::Relaxed)
    }

    /// Set the request limit, adding up to `grace` extra requests at random
    /// so workers started together do not all recycle together.
    pub fn set_max_request(&self, max_request: u32, grace: u32) {
        let limit = if max_request == 0 {
            0
        } else if grace == 0 {
            max_request
        } else {
            max_request.saturating_add(rand::thread_rng().gen_range(0..=grace))
        };
        self.max_request.store(limit, Ordering::Release);
    }

    /// Effective request limit; zero means unlimited.
    pub fn max_request(&self) -> u32 {
        self.max_request.load(Ordering::Acquire)
    }

    pub fn has_exceeded_max_request(&self) -> bool {
        let limit = self.max_request();
        limit > 0 && self.request_count() >= u64::from(limit)
    }

    pub fn add_dispatch_count(&self) -> u64 {
        self.dispatch_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn add_request_count(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn add_response_count(&self) -> u64 {
        self.response_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Acquire)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Acquire)
    }

    pub fn response_count(&self) -> u64 {
        self.response_count.load(Ordering::Acquire)
    }

    /// Concurrent tasks in flight inside the worker process.
    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn enter_task(&self) -> u32 {
        self.concurrency.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn leave_task(&self) -> u32 {
        self.concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }
}

/// Immutable identity of a worker process, captured when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: Pid,
    pub generation: u32,
}

enum Storage {
    Shared(SharedSlice<Worker>),
    Local(Box<[Worker]>),
}

/// The pool's worker slots, indexed by `id - start_id`.
pub struct WorkerTable {
    start_id: WorkerId,
    storage: Storage,
}

impl WorkerTable {
    /// Allocate `worker_num` slots in shared memory.
    pub fn shared(start_id: WorkerId, worker_num: usize) -> Result<Self> {
        let slice = SharedSlice::new(worker_num, |i| Worker::new(start_id + i as u32, true))?;
        Ok(Self {
            start_id,
            storage: Storage::Shared(slice),
        })
    }

    /// Allocate `worker_num` slots in process-private memory.
    pub fn local(start_id: WorkerId, worker_num: usize) -> Self {
        let workers = (0..worker_num)
            .map(|i| Worker::new(start_id + i as u32, false))
            .collect();
        Self {
            start_id,
            storage: Storage::Local(workers),
        }
    }

    pub fn workers(&self) -> &[Worker] {
        match &self.storage {
            Storage::Shared(slice) => &slice[..],
            Storage::Local(boxed) => &boxed[..],
        }
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers().is_empty()
    }

    pub fn start_id(&self) -> WorkerId {
        self.start_id
    }

    pub fn slot(&self, slot: usize) -> Option<&Worker> {
        self.workers().get(slot)
    }

    /// Look up a worker by logical id.
    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        id.checked_sub(self.start_id)
            .and_then(|slot| self.workers().get(slot as usize))
    }

    pub fn slot_of(&self, id: WorkerId) -> Result<usize> {
        id.checked_sub(self.start_id)
            .map(|slot| slot as usize)
            .filter(|&slot| slot < self.len())
            .ok_or_else(|| Error::State(format!("no worker with id {}", id)))
    }

    /// Snapshot the identity of the process currently in `slot`.
    pub fn identity(&self, slot: usize) -> Option<WorkerIdentity> {
        let worker = self.slot(slot)?;
        Some(WorkerIdentity {
            id: worker.id(),
            slot,
            pid: worker.pid()?,
            generation: worker.generation(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_worker() -> Worker {
        let worker = Worker::new(0, false);
        worker.reset();
        worker.attach(Pid::from_raw(1234));
        worker
    }

    #[test]
    fn test_spawn_attach_reap() {
        let worker = Worker::new(5, false);
        assert_eq!(worker.status(), WorkerStatus::Reaped);
        assert_eq!(worker.pid(), None);

        worker.reset();
        assert_eq!(worker.status(), WorkerStatus::Spawning);
        assert!(!worker.is_dispatchable());

        worker.attach(Pid::from_raw(42));
        assert_eq!(worker.pid(), Some(Pid::from_raw(42)));
        assert!(worker.is_idle());
        assert_eq!(worker.generation(), 1);

        worker.mark_reaped();
        assert_eq!(worker.pid(), None);
        assert_eq!(worker.status(), WorkerStatus::Reaped);
    }

    #[test]
    fn test_busy_idle_transitions() {
        let worker = live_worker();
        assert!(worker.try_mark_busy());
        assert!(!worker.try_mark_busy());
        assert!(worker.is_busy());
        assert!(worker.mark_idle());
        assert!(worker.is_idle());
    }

    #[test]
    fn test_exiting_is_sticky() {
        let worker = live_worker();
        assert!(worker.try_mark_busy());
        assert!(worker.mark_exiting());
        assert!(!worker.mark_exiting());
        assert!(!worker.mark_idle());
        assert!(worker.is_exiting());
        assert!(!worker.try_mark_busy());
    }

    #[test]
    fn test_detach_transitions() {
        let worker = live_worker();
        assert!(worker.try_mark_busy());
        assert!(worker.mark_detached());
        assert!(worker.is_detached());
        assert!(!worker.is_dispatchable());
        assert!(!worker.mark_idle());
        assert!(!worker.mark_detached());

        let stopping = live_worker();
        assert!(stopping.mark_exiting());
        assert!(!stopping.mark_detached());
        assert!(stopping.is_exiting());
    }

    #[test]
    fn test_max_request_without_grace() {
        let worker = live_worker();
        worker.set_max_request(2, 0);
        assert_eq!(worker.max_request(), 2);
        worker.add_request_count();
        assert!(!worker.has_exceeded_max_request());
        worker.add_request_count();
        assert!(worker.has_exceeded_max_request());
        assert!(!worker.is_dispatchable());
    }

    #[test]
    fn test_max_request_grace_bounds() {
        let worker = live_worker();
        for _ in 0..50 {
            worker.set_max_request(100, 10);
            let limit = worker.max_request();
            assert!((100..=110).contains(&limit));
        }
        worker.set_max_request(0, 10);
        assert_eq!(worker.max_request(), 0);
        assert!(!worker.has_exceeded_max_request());
    }

    #[test]
    fn test_concurrency_never_underflows() {
        let worker = live_worker();
        assert_eq!(worker.enter_task(), 1);
        assert_eq!(worker.leave_task(), 0);
        assert_eq!(worker.leave_task(), 0);
    }

    #[test]
    fn test_table_lookup() {
        let table = WorkerTable::local(10, 3);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(11).map(Worker::id), Some(11));
        assert!(table.get(9).is_none());
        assert!(table.get(13).is_none());
        assert_eq!(table.slot_of(12).unwrap(), 2);
        assert!(table.slot_of(13).is_err());
        assert!(!table.slot(0).unwrap().is_shared());
    }

    #[test]
    fn test_shared_table() {
        let table = WorkerTable::shared(0, 2).unwrap();
        assert!(table.slot(1).unwrap().is_shared());
        assert!(table.identity(0).is_none());
        table.slot(0).unwrap().reset();
        table.slot(0).unwrap().attach(Pid::from_raw(77));
        let identity = table.identity(0).unwrap();
        assert_eq!(identity.pid, Pid::from_raw(77));
        assert_eq!(identity.id, 0);
    }
}
