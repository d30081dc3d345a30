//! Integration test: stream workers recycled after every request while large
//! frames are still queued on their connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use corral_core::{
    ExitStatus, IpcMode, PoolConfig, PoolHandler, ProcessPool, ProtocolType, Reply,
    TaskMessage, WorkerContext, WorkerIdentity,
};

#[derive(Default)]
struct Sizes {
    crashes: Arc<AtomicUsize>,
}

impl PoolHandler for Sizes {
    fn on_task(&mut self, ctx: &mut WorkerContext, task: TaskMessage) -> corral_core::Result<()> {
        let first = task.payload.first().copied().unwrap_or(b'?');
        ctx.response(format!("{}:{}", first as char, task.payload.len()))?;
        Ok(())
    }

    fn on_worker_error(&mut self, _pool: &ProcessPool, _worker: &WorkerIdentity, _status: &ExitStatus) {
        self.crashes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_fork_recycled_stream_worker_hands_over_whole_frames() {
    let config = PoolConfig {
        worker_num: 1,
        ipc_mode: IpcMode::StreamSocket,
        protocol: ProtocolType::Stream,
        max_request: 1,
        reload_timeout_ms: 5000,
        ..PoolConfig::default()
    };
    let crashes = Arc::new(AtomicUsize::new(0));
    let handler = Sizes {
        crashes: crashes.clone(),
    };
    let mut pool = ProcessPool::create(config, handler).unwrap();
    pool.start().unwrap();

    let frames: Vec<Vec<u8>> = (0..12u8)
        .map(|i| vec![b'a' + i; 40_000 + usize::from(i) * 17_000])
        .collect();
    let mut replies: Vec<Reply> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);

    for (i, frame) in frames.iter().enumerate() {
        loop {
            assert!(Instant::now() < deadline, "frame {} never dispatched", i);
            match pool.dispatch_sync(TaskMessage::new(frame.clone())) {
                Ok(_) => break,
                Err(e) if e.is_retryable() => {
                    replies.extend(pool.poll_replies(Duration::from_millis(20)).unwrap());
                    while pool.wait_once(false).unwrap().is_some() {}
                    pool.tick(Instant::now());
                }
                Err(e) => panic!("dispatch failed: {}", e),
            }
        }
    }

    while replies.len() < frames.len() {
        assert!(Instant::now() < deadline, "only {} of {} replies", replies.len(), frames.len());
        replies.extend(pool.poll_replies(Duration::from_millis(20)).unwrap());
        while pool.wait_once(false).unwrap().is_some() {}
        pool.tick(Instant::now());
        thread::sleep(Duration::from_millis(5));
    }

    let mut got: Vec<String> = replies
        .iter()
        .map(|r| String::from_utf8(r.message.payload.clone()).unwrap())
        .collect();
    got.sort();
    let mut want: Vec<String> = frames
        .iter()
        .map(|f| format!("{}:{}", f[0] as char, f.len()))
        .collect();
    want.sort();
    assert_eq!(got, want);
    assert_eq!(crashes.load(Ordering::SeqCst), 0);
    assert!(pool.worker(0).unwrap().generation() > 1);

    pool.shutdown().unwrap();
}
