//! Integration test: rolling reload of real workers over a System V message queue.

use std::thread;
use std::time::{Duration, Instant};

use corral_core::{
    IpcMode, PoolConfig, PoolHandler, PoolState, ProcessPool, ProtocolType, Reply, TaskMessage,
    WorkerContext,
};

struct Upper;

impl PoolHandler for Upper {
    fn on_task(&mut self, ctx: &mut WorkerContext, task: TaskMessage) -> corral_core::Result<()> {
        ctx.response(task.payload.to_ascii_uppercase())?;
        Ok(())
    }
}

/// Reply payloads, sorted; stream frames carry no task id to order by.
fn collect(pool: &mut ProcessPool, want: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut replies: Vec<Reply> = Vec::new();
    while replies.len() < want {
        assert!(Instant::now() < deadline, "only {} of {} replies", replies.len(), want);
        replies.extend(pool.poll_replies(Duration::from_millis(50)).unwrap());
    }
    let mut payloads: Vec<String> = replies
        .into_iter()
        .map(|r| String::from_utf8(r.message.payload).unwrap())
        .collect();
    payloads.sort();
    payloads
}

#[test]
fn test_fork_msg_queue_reload() {
    let config = PoolConfig {
        worker_num: 2,
        ipc_mode: IpcMode::MsgQueue,
        protocol: ProtocolType::Task,
        reload_timeout_ms: 2000,
        ..PoolConfig::default()
    };
    let mut pool = ProcessPool::create(config, Upper).unwrap();
    pool.start().unwrap();
    let first_pids: Vec<_> = pool.worker_pids().into_iter().map(|(_, pid)| pid).collect();

    for i in 0..6u64 {
        pool.dispatch_sync(TaskMessage::new(format!("before-{}", i)).with_task_id(i))
            .unwrap();
    }
    let want: Vec<String> = (0..6).map(|i| format!("BEFORE-{}", i)).collect();
    assert_eq!(collect(&mut pool, 6), want);

    assert!(pool.reload());
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.is_reloading() {
        assert!(Instant::now() < deadline, "reload did not finish");
        while pool.wait_once(false).unwrap().is_some() {}
        pool.tick(Instant::now());
        thread::sleep(Duration::from_millis(10));
    }
    let second_pids: Vec<_> = pool.worker_pids().into_iter().map(|(_, pid)| pid).collect();
    assert_eq!(second_pids.len(), 2);
    assert!(second_pids.iter().all(|pid| !first_pids.contains(pid)));

    for i in 0..6u64 {
        pool.dispatch_sync(TaskMessage::new(format!("after-{}", i)).with_task_id(i))
            .unwrap();
    }
    let want: Vec<String> = (0..6).map(|i| format!("AFTER-{}", i)).collect();
    assert_eq!(collect(&mut pool, 6), want);

    pool.shutdown().unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);
}
