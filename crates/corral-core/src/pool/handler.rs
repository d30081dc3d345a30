//! Application callbacks.

use crate::error::Result;
use crate::protocol::TaskMessage;
use crate::worker::{ExitStatus, WorkerContext, WorkerId, WorkerIdentity};

use super::ProcessPool;

/// What the application plugs into a pool.
///
/// Master-side callbacks receive the pool read-only; worker-side callbacks
/// receive the worker's [`WorkerContext`]. Only [`on_task`](Self::on_task) is
/// required.
pub trait PoolHandler {
    // --- master process ---

    /// All workers have been spawned.
    fn on_start(&mut self, _pool: &ProcessPool) {}

    /// Every worker has exited and the pool is about to stop.
    fn on_shutdown(&mut self, _pool: &ProcessPool) {}

    fn on_before_reload(&mut self, _pool: &ProcessPool) {}

    fn on_after_reload(&mut self, _pool: &ProcessPool) {}

    /// A reply or message from a worker reached the master. `from` is `None`
    /// when the transport does not tell which worker sent it.
    fn on_message(&mut self, _pool: &ProcessPool, _from: Option<WorkerId>, _message: TaskMessage) {}

    /// A worker exited as expected: stop, reload, recycle, shutdown, or a
    /// detached process finishing.
    fn on_worker_exit(&mut self, _pool: &ProcessPool, _worker: &WorkerIdentity, _status: &ExitStatus) {}

    /// A worker died unexpectedly. The pool respawns it either way.
    fn on_worker_error(&mut self, _pool: &ProcessPool, worker: &WorkerIdentity, status: &ExitStatus) {
        tracing::warn!(worker = worker.id, "worker {} died unexpectedly: {}", worker.id, status);
    }

    /// `waitpid` reported a pid the pool does not own, such as a helper
    /// process the application forked itself. Return true if the handler
    /// recognised it; otherwise the pool logs the stray exit as a warning.
    fn on_worker_not_found(&mut self, _pool: &ProcessPool, _status: &ExitStatus) -> bool {
        false
    }

    // --- worker process ---

    fn on_worker_start(&mut self, _ctx: &mut WorkerContext) {}

    /// The worker loop has ended; the process exits right after.
    fn on_worker_stop(&mut self, _ctx: &mut WorkerContext) {}

    /// Handle one task. Errors are logged and the worker carries on.
    fn on_task(&mut self, ctx: &mut WorkerContext, task: TaskMessage) -> Result<()>;

    /// An out-of-band message sent with [`ProcessPool::send_message`].
    fn on_worker_message(&mut self, _ctx: &mut WorkerContext, _message: TaskMessage) {}
}
