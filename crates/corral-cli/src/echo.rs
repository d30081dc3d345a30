//! Demo handler: workers reply with the upper-cased payload.

use corral_core::{
    ExitStatus, PoolHandler, ProcessPool, TaskMessage, WorkerContext, WorkerId, WorkerIdentity,
};

use crate::colors;

#[derive(Default)]
pub struct EchoHandler {
    /// Print each reply as it reaches the master.
    pub print_messages: bool,
}

impl PoolHandler for EchoHandler {
    fn on_message(&mut self, _pool: &ProcessPool, from: Option<WorkerId>, message: TaskMessage) {
        if self.print_messages {
            println!(
                "worker {}: {}",
                from.map_or_else(|| "?".to_string(), |id| id.to_string()),
                String::from_utf8_lossy(&message.payload)
            );
        }
    }

    fn on_before_reload(&mut self, _pool: &ProcessPool) {
        println!("{}Reloading workers...{}", colors::YELLOW, colors::RESET);
    }

    fn on_after_reload(&mut self, pool: &ProcessPool) {
        println!(
            "{}Reload #{} complete{}",
            colors::GREEN,
            pool.reload_count(),
            colors::RESET
        );
    }

    fn on_worker_error(&mut self, _pool: &ProcessPool, worker: &WorkerIdentity, status: &ExitStatus) {
        println!(
            "{}worker {} died ({}), respawning{}",
            colors::YELLOW,
            worker.id,
            status,
            colors::RESET
        );
    }

    fn on_worker_start(&mut self, ctx: &mut WorkerContext) {
        tracing::debug!(worker = ctx.id(), "worker ready");
    }

    fn on_task(&mut self, ctx: &mut WorkerContext, task: TaskMessage) -> corral_core::Result<()> {
        ctx.response(task.payload.to_ascii_uppercase())?;
        Ok(())
    }

    fn on_worker_message(&mut self, ctx: &mut WorkerContext, message: TaskMessage) {
        tracing::info!(
            worker = ctx.id(),
            "message box: {}",
            String::from_utf8_lossy(&message.payload)
        );
    }
}
