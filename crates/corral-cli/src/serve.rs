//! Serve command: keep a pool running under the master loop.

use anyhow::Context;
use corral_core::{IpcMode, PoolConfig, ProcessPool};

use crate::colors;
use crate::echo::EchoHandler;

/// Backlog handed to `listen(2)` for `--listen`.
const LISTEN_BACKLOG: i32 = 128;

pub fn execute(config: PoolConfig, listen: Option<String>) -> anyhow::Result<()> {
    let worker_num = config.worker_num;
    let ipc_mode = config.ipc_mode;

    let handler = EchoHandler {
        print_messages: true,
        ..EchoHandler::default()
    };
    let mut pool = ProcessPool::create(config, handler)?;
    if let Some(addr) = &listen {
        let bound = pool
            .listen(addr, LISTEN_BACKLOG)
            .with_context(|| format!("failed to listen on {}", addr))?;
        println!("{}Listening{} on {}", colors::BOLD, colors::RESET, bound);
    }
    if ipc_mode == IpcMode::None && listen.is_none() {
        pool.set_main_loop(|rt| {
            while !rt.is_stopping() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            0
        });
    }
    pool.start().context("failed to start pool")?;

    println!(
        "{}Serving{} with {} workers (master pid {}), SIGUSR1 reloads, SIGTERM stops",
        colors::BOLD,
        colors::RESET,
        worker_num,
        pool.master_pid()
    );

    pool.wait()?;

    println!(
        "{}Stopped{} after {} reloads",
        colors::GREEN,
        colors::RESET,
        pool.reload_count()
    );
    Ok(())
}
