//! Run command: push a batch of tasks through a fresh pool.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use corral_core::{IpcMode, PoolConfig, ProcessPool, Reply, TaskMessage};

use crate::colors;
use crate::echo::EchoHandler;

const REPLY_POLL: Duration = Duration::from_millis(50);
const REAP_POLL: Duration = Duration::from_millis(10);

/// Start a pool, dispatch `tasks` tasks, collect the replies and shut down.
pub fn execute(config: PoolConfig, tasks: u32, reload: bool, timeout_secs: u64) -> anyhow::Result<()> {
    let start = Instant::now();
    let ipc_mode = config.ipc_mode;
    let worker_num = config.worker_num;

    println!(
        "{}Starting{} {} workers ({:?} over {:?})",
        colors::BOLD,
        colors::RESET,
        worker_num,
        config.protocol,
        ipc_mode
    );

    let mut pool = ProcessPool::create(config, EchoHandler::default())?;
    if ipc_mode == IpcMode::None {
        // No channel: workers idle until they are told to stop.
        pool.set_main_loop(|rt| {
            while !rt.is_stopping() {
                thread::sleep(REPLY_POLL);
            }
            0
        });
    }
    pool.start().context("failed to start pool")?;

    let outcome = drive(&mut pool, ipc_mode, tasks, reload, Duration::from_secs(timeout_secs));
    pool.shutdown()?;
    let (dispatched, mut replies) = outcome?;

    replies.sort_by_key(|r| r.message.task_id);
    println!("\n{}Replies:{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    for reply in &replies {
        println!(
            "{}worker {}{} task {}: {}",
            colors::CYAN,
            reply
                .worker_id
                .map_or_else(|| "?".to_string(), |id| id.to_string()),
            colors::RESET,
            reply.message.task_id,
            String::from_utf8_lossy(&reply.message.payload)
        );
    }

    let total_time = start.elapsed();
    println!("\n{}", "─".repeat(50));
    println!(
        "{}Completed{} {} tasks, {} replies, {} reloads in {:.2}s",
        colors::GREEN,
        colors::RESET,
        dispatched,
        replies.len(),
        pool.reload_count(),
        total_time.as_secs_f64()
    );
    if pool.scheduler_warnings() > 0 {
        println!(
            "{}{} dispatches found no idle worker{}",
            colors::YELLOW,
            pool.scheduler_warnings(),
            colors::RESET
        );
    }

    pool.destroy()?;
    Ok(())
}

fn drive(
    pool: &mut ProcessPool,
    ipc_mode: IpcMode,
    tasks: u32,
    reload: bool,
    timeout: Duration,
) -> anyhow::Result<(u32, Vec<Reply>)> {
    let mut replies = Vec::new();
    let mut dispatched = 0;

    if ipc_mode == IpcMode::None {
        if tasks > 0 {
            println!("ipc mode none has no channel, skipping {} tasks", tasks);
        }
    } else {
        let deadline = Instant::now() + timeout;
        while replies.len() < tasks as usize {
            if Instant::now() >= deadline {
                bail!(
                    "timed out with {} of {} replies ({} dispatched)",
                    replies.len(),
                    tasks,
                    dispatched
                );
            }
            // Dispatch until every worker is busy or its endpoint is full,
            // then collect replies so workers can make progress.
            while dispatched < tasks {
                let task = TaskMessage::new(format!("task-{}", dispatched))
                    .with_task_id(u64::from(dispatched));
                match pool.dispatch(task) {
                    Ok(_) => dispatched += 1,
                    Err(e) if e.is_retryable() => break,
                    Err(e) => {
                        return Err(e).with_context(|| format!("failed to dispatch task {}", dispatched));
                    }
                }
            }
            replies.extend(pool.poll_replies(REPLY_POLL)?);
            while pool.wait_once(false)?.is_some() {}
            pool.tick(Instant::now());
        }
    }

    if reload && pool.reload() {
        let deadline =
            Instant::now() + pool.config().reload_timeout() * (pool.table().len() as u32 + 1);
        while pool.is_reloading() {
            if Instant::now() >= deadline {
                bail!("reload did not finish in time");
            }
            while pool.wait_once(false)?.is_some() {}
            pool.tick(Instant::now());
            thread::sleep(REAP_POLL);
        }
    }

    Ok((dispatched, replies))
}
