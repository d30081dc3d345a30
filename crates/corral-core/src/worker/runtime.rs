//! The loop a worker process runs.
//!
//! [`WorkerRuntime::run`] is the default loop. A custom main loop (see
//! [`ProcessPool::set_main_loop`](crate::ProcessPool::set_main_loop)) can
//! instead watch [`readable_fd`](WorkerRuntime::readable_fd) in its own event
//! loop and call [`handle_readable`](WorkerRuntime::handle_readable) whenever
//! it fires.
//!
//! A stop request never cuts a message in half: while the codec holds part
//! of a frame the loop keeps reading until that frame is complete, so the
//! next process on the same connection starts on a frame boundary.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{Pid, dup2_stderr, dup2_stdin, dup2_stdout};

use crate::error::{Error, Result};
use crate::ipc::{Channel, Listener, poll_readable, transport_error};
use crate::pool::PoolHandler;
use crate::protocol::{FrameCodec, ProtocolType, TaskMessage};

use super::WorkerContext;

/// How often the loop wakes up to check stop flags and the parent.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause between samples of a channel that has no descriptor to poll.
const QUEUE_POLL: Duration = Duration::from_millis(10);

/// Drives task delivery inside one worker process.
pub struct WorkerRuntime<'a> {
    ctx: WorkerContext,
    handler: &'a mut dyn PoolHandler,
    channel: Option<Arc<dyn Channel>>,
    /// Nobody else reads `channel`, so a detached worker may drain it.
    exclusive: bool,
    listener: Option<Arc<Listener>>,
    codec: Box<dyn FrameCodec>,
    buf: Vec<u8>,
    master_pid: Pid,
    handled: u64,
}

impl<'a> WorkerRuntime<'a> {
    pub(crate) fn new(
        ctx: WorkerContext,
        handler: &'a mut dyn PoolHandler,
        channel: Option<Arc<dyn Channel>>,
        codec: Box<dyn FrameCodec>,
        buf_size: usize,
        master_pid: Pid,
    ) -> Self {
        Self {
            ctx,
            handler,
            channel,
            exclusive: true,
            listener: None,
            codec,
            buf: vec![0u8; buf_size.max(1)],
            master_pid,
            handled: 0,
        }
    }

    /// Mark the channel as shared with sibling workers (a message queue).
    pub(crate) fn shared_channel(mut self, shared: bool) -> Self {
        self.exclusive = !shared;
        self
    }

    /// Also accept external peers on `listener`.
    pub(crate) fn with_listener(mut self, listener: Option<Arc<Listener>>) -> Self {
        self.listener = listener;
        self
    }

    pub fn context(&mut self) -> &mut WorkerContext {
        &mut self.ctx
    }

    /// Descriptor that becomes readable when tasks are waiting. `None` for
    /// transports without one (message queues) and for pools without IPC.
    pub fn readable_fd(&self) -> Option<RawFd> {
        self.channel
            .as_ref()
            .and_then(|c| c.poll_fd())
            .map(|fd| fd.as_raw_fd())
    }

    /// Descriptor that becomes readable when an external peer connects.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.poll_fd().as_raw_fd())
    }

    pub fn is_stopping(&self) -> bool {
        self.ctx.is_stopping()
    }

    /// Tasks handled by this process so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Whether the master that forked us is still our parent.
    pub fn master_alive(&self) -> bool {
        nix::unistd::getppid() == self.master_pid
    }

    pub(crate) fn start(&mut self) {
        tracing::debug!(worker = self.ctx.id(), pid = %self.ctx.identity().pid, "worker started");
        self.handler.on_worker_start(&mut self.ctx);
    }

    pub(crate) fn finish(&mut self) {
        self.handler.on_worker_stop(&mut self.ctx);
        tracing::debug!(worker = self.ctx.id(), handled = self.handled, "worker stopped");
    }

    /// Whether the loop has more to read: it has not been asked to stop, or
    /// a frame is still half received on a channel only this process reads.
    fn keep_reading(&self) -> bool {
        !self.ctx.is_stopping() || (self.exclusive && self.codec.is_mid_frame())
    }

    /// Drain everything queued on the channel without blocking.
    ///
    /// Returns the number of messages delivered to the handler.
    pub fn handle_readable(&mut self) -> Result<usize> {
        let Some(channel) = self.channel.clone() else {
            return Ok(0);
        };
        let mut delivered = 0;
        while self.keep_reading() || (self.ctx.is_detached() && self.exclusive) {
            match channel.try_recv(&mut self.buf) {
                Ok(n) => delivered += self.feed(n)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(transport_error("worker recv", e)),
            }
        }
        Ok(delivered)
    }

    /// Accept one external peer, if one is waiting, and handle its request.
    pub fn handle_peer(&mut self) -> Result<usize> {
        let Some(listener) = self.listener.clone() else {
            return Ok(0);
        };
        let mut peer = match listener.accept() {
            Ok(peer) => peer,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                return Ok(0);
            }
            Err(e) => return Err(transport_error("accept", e)),
        };
        let message = match peer.read_request(&mut self.buf) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(worker = self.ctx.id(), "peer closed before sending a request");
                return Ok(0);
            }
            Err(e) => {
                tracing::warn!(worker = self.ctx.id(), "dropping peer: {}", e);
                return Ok(0);
            }
        };
        self.ctx.set_peer(peer);
        self.deliver(message);
        drop(self.ctx.take_peer());
        Ok(1)
    }

    /// The default worker loop. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        if self.channel.is_none() && self.listener.is_none() {
            tracing::error!(worker = self.ctx.id(), "no IPC channel and no main loop");
            return 1;
        }
        while self.keep_reading() {
            if !self.master_alive() {
                tracing::warn!(worker = self.ctx.id(), "master is gone, exiting");
                return 1;
            }
            if let Err(e) = self.turn() {
                tracing::error!(worker = self.ctx.id(), "worker loop failed: {}", e);
                return 1;
            }
        }
        0
    }

    /// Wait for work for at most one poll interval and handle what arrived.
    fn turn(&mut self) -> Result<usize> {
        let channel = self.channel.clone();
        // Peers are only accepted while the worker is not stopping.
        let listener = self.listener.clone().filter(|_| !self.ctx.is_stopping());
        let channel_fd = channel.as_ref().and_then(|c| c.poll_fd());

        // A message queue has nothing to poll: sample it, then wait briefly
        // so the parent check runs again soon.
        let mut timeout = POLL_INTERVAL;
        if channel.is_some() && channel_fd.is_none() {
            let delivered = self.handle_readable()?;
            if delivered > 0 {
                return Ok(delivered);
            }
            timeout = QUEUE_POLL;
        }

        let mut fds = Vec::with_capacity(2);
        fds.extend(channel_fd);
        let peer_index = fds.len();
        fds.extend(listener.as_ref().map(|l| l.poll_fd()));
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let mut delivered = 0;
        for index in poll_readable(&fds, timeout)? {
            delivered += if index == peer_index {
                self.handle_peer()?
            } else {
                self.handle_readable()?
            };
        }
        Ok(delivered)
    }

    /// Decode `n` received bytes and deliver the completed messages.
    fn feed(&mut self, n: usize) -> Result<usize> {
        let messages = match self.codec.decode(&self.buf[..n]) {
            Ok(messages) => messages,
            // A bad packet only costs that packet; a desynced byte stream is fatal.
            Err(Error::Protocol(reason)) if self.codec.protocol() != ProtocolType::Stream => {
                tracing::warn!(worker = self.ctx.id(), "dropping malformed packet: {}", reason);
                return Ok(0);
            }
            Err(Error::Spill(reason)) => {
                tracing::warn!(worker = self.ctx.id(), "dropping task: {}", reason);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let count = messages.len();
        for message in messages {
            self.deliver(message);
        }
        Ok(count)
    }

    fn deliver(&mut self, message: TaskMessage) {
        if message.out_of_band {
            self.handler.on_worker_message(&mut self.ctx, message);
            return;
        }

        // A detached process no longer owns the shared record.
        if !self.ctx.is_detached() {
            // Point-to-point pools are marked busy by the master at dispatch.
            self.ctx.worker().try_mark_busy();
            self.ctx.worker().add_request_count();
            self.ctx.worker().enter_task();
        }

        let task_id = message.task_id;
        self.ctx.begin_task(task_id);
        if let Err(e) = self.handler.on_task(&mut self.ctx, message) {
            tracing::error!(worker = self.ctx.id(), task_id, "task failed: {}", e);
        }
        self.ctx.end_task();
        self.handled += 1;
        if self.ctx.is_detached() {
            return;
        }

        let worker = self.ctx.worker();
        worker.leave_task();
        if worker.has_exceeded_max_request() {
            tracing::info!(
                worker = worker.id(),
                requests = worker.request_count(),
                "max_request reached, recycling"
            );
            worker.mark_exiting();
            self.ctx.stop();
        } else {
            worker.mark_idle();
        }
    }
}

/// Point the selected standard streams at `/dev/null`.
pub(crate) fn redirect_stdio(stdin: bool, stdout: bool, stderr: bool) -> Result<()> {
    if !(stdin || stdout || stderr) {
        return Ok(());
    }
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let redirect = |result: nix::Result<()>| result.map_err(|errno| Error::Io(errno.into()));
    if stdin {
        redirect(dup2_stdin(&null))?;
    }
    if stdout {
        redirect(dup2_stdout(&null))?;
    }
    if stderr {
        redirect(dup2_stderr(&null))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ListenAddr, MsgQueue, MsgQueueEndpoint, PipeEndpoint, SocketEndpoint, request};
    use crate::protocol::{CodecSettings, encode_stream_frame};
    use crate::worker::{Responder, WorkerTable};

    #[derive(Default)]
    struct Upper {
        seen: Vec<u64>,
        lengths: Vec<usize>,
        messages: Vec<Vec<u8>>,
        detach_on: Option<u64>,
    }

    impl PoolHandler for Upper {
        fn on_task(&mut self, ctx: &mut WorkerContext, task: TaskMessage) -> Result<()> {
            self.seen.push(task.task_id);
            self.lengths.push(task.payload.len());
            if self.detach_on == Some(task.task_id) {
                ctx.detach()?;
            }
            ctx.response(task.payload.to_ascii_uppercase())?;
            Ok(())
        }

        fn on_worker_message(&mut self, _ctx: &mut WorkerContext, message: TaskMessage) {
            self.messages.push(message.payload);
        }
    }

    fn settings() -> CodecSettings {
        CodecSettings {
            max_packet_size: 256,
            max_frame_size: 4096,
            spill_dir: std::env::temp_dir(),
        }
    }

    fn live_table(max_request: u32) -> Arc<WorkerTable> {
        let table = Arc::new(WorkerTable::local(0, 1));
        let worker = table.slot(0).unwrap();
        worker.reset();
        worker.set_max_request(max_request, 0);
        worker.attach(Pid::from_raw(4242));
        table
    }

    /// A context replying over `worker_end` with `protocol`.
    fn context(table: &Arc<WorkerTable>, worker_end: &Arc<dyn Channel>, protocol: ProtocolType) -> WorkerContext {
        let responder = Responder::new(worker_end.clone(), protocol.codec(&settings()), None);
        WorkerContext::new(table.identity(0).unwrap(), table.clone(), Some(responder))
    }

    fn pipe() -> (PipeEndpoint, Arc<dyn Channel>) {
        let (master, worker_end) = PipeEndpoint::pair().unwrap();
        (master, Arc::new(worker_end))
    }

    fn send_task(master: &PipeEndpoint, message: &TaskMessage) {
        let mut codec = ProtocolType::Task.codec(&settings());
        for packet in codec.encode(message).unwrap() {
            master.send(&packet).unwrap();
        }
    }

    fn runtime<'a>(
        ctx: WorkerContext,
        handler: &'a mut Upper,
        channel: Option<Arc<dyn Channel>>,
        protocol: ProtocolType,
        buf_size: usize,
    ) -> WorkerRuntime<'a> {
        WorkerRuntime::new(
            ctx,
            handler,
            channel,
            protocol.codec(&settings()),
            buf_size,
            nix::unistd::getppid(),
        )
    }

    #[test]
    fn test_handle_readable_delivers_and_replies() {
        let table = live_table(0);
        let (master, worker_end) = pipe();
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper::default();
        send_task(&master, &TaskMessage::new("ab").with_task_id(1));
        send_task(&master, &TaskMessage::new("cd").with_task_id(2));
        send_task(&master, &TaskMessage::new("note").out_of_band());
        table.slot(0).unwrap().try_mark_busy();

        let mut rt = runtime(ctx, &mut handler, Some(worker_end), ProtocolType::Task, 256);
        assert_eq!(rt.handle_readable().unwrap(), 3);
        assert_eq!(rt.handled(), 2);
        assert_eq!(rt.handle_readable().unwrap(), 0);
        drop(rt);

        assert_eq!(handler.seen, vec![1, 2]);
        assert_eq!(handler.messages, vec![b"note".to_vec()]);
        let worker = table.slot(0).unwrap();
        assert!(worker.is_idle());
        assert_eq!(worker.request_count(), 2);
        assert_eq!(worker.response_count(), 2);

        let mut buf = [0u8; 256];
        let n = master.try_recv(&mut buf).unwrap();
        let reply = ProtocolType::Task.codec(&settings()).decode(&buf[..n]).unwrap();
        assert_eq!(reply[0].payload, b"AB");
        assert_eq!(reply[0].task_id, 1);
    }

    #[test]
    fn test_malformed_packet_is_dropped() {
        let table = live_table(0);
        let (master, worker_end) = pipe();
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper::default();
        master.send(b"garbage").unwrap();
        send_task(&master, &TaskMessage::new("ok").with_task_id(5));

        let mut rt = runtime(ctx, &mut handler, Some(worker_end), ProtocolType::Task, 256);
        assert_eq!(rt.handle_readable().unwrap(), 1);
        drop(rt);
        assert_eq!(handler.seen, vec![5]);
    }

    #[test]
    fn test_max_request_stops_worker() {
        let table = live_table(1);
        let (master, worker_end) = pipe();
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper::default();
        send_task(&master, &TaskMessage::new("a").with_task_id(1));
        send_task(&master, &TaskMessage::new("b").with_task_id(2));

        let mut rt = runtime(ctx, &mut handler, Some(worker_end), ProtocolType::Task, 256);
        assert_eq!(rt.handle_readable().unwrap(), 1);
        assert!(rt.is_stopping());
        assert_eq!(rt.run(), 0);
        drop(rt);

        assert_eq!(handler.seen, vec![1]);
        assert!(table.slot(0).unwrap().is_exiting());
    }

    #[test]
    fn test_recycled_worker_finishes_half_read_frame() {
        let table = live_table(1);
        let (master, worker_end) = SocketEndpoint::pair().unwrap();
        let worker_end: Arc<dyn Channel> = Arc::new(worker_end);

        let mut bytes = encode_stream_frame(b"first", 4096).unwrap();
        bytes.extend(encode_stream_frame(&[b'z'; 200], 4096).unwrap());
        master.send(&bytes).unwrap();

        // The 64-byte buffer ends the first read in the middle of frame two.
        let mut handler = Upper::default();
        let ctx = context(&table, &worker_end, ProtocolType::Stream);
        let mut rt = runtime(ctx, &mut handler, Some(worker_end.clone()), ProtocolType::Stream, 64);
        assert_eq!(rt.handle_readable().unwrap(), 2);
        assert!(rt.is_stopping());
        assert_eq!(rt.run(), 0);
        drop(rt);
        assert_eq!(handler.lengths, vec![5, 200]);

        // The next process on the same connection starts on a frame boundary.
        let mut successor = Upper::default();
        let ctx = context(&table, &worker_end, ProtocolType::Stream);
        let mut rt = runtime(ctx, &mut successor, Some(worker_end.clone()), ProtocolType::Stream, 64);
        assert_eq!(rt.handle_readable().unwrap(), 0);
        drop(rt);

        let follow_up = encode_stream_frame(b"next", 4096).unwrap();
        master.send(&follow_up).unwrap();
        let ctx = context(&table, &worker_end, ProtocolType::Stream);
        let mut rt = runtime(ctx, &mut successor, Some(worker_end.clone()), ProtocolType::Stream, 64);
        assert_eq!(rt.handle_readable().unwrap(), 1);
        drop(rt);
        assert_eq!(successor.lengths, vec![4]);

        let mut codec = ProtocolType::Stream.codec(&settings());
        let mut replies = Vec::new();
        let mut buf = [0u8; 512];
        while replies.len() < 3 {
            let n = master.recv(&mut buf).unwrap();
            replies.extend(codec.decode(&buf[..n]).unwrap());
        }
        assert_eq!(replies[0].payload, b"FIRST");
        assert_eq!(replies[1].payload, vec![b'Z'; 200]);
        assert_eq!(replies[2].payload, b"NEXT");
    }

    #[test]
    fn test_detached_worker_drains_its_channel_then_stops() {
        let table = live_table(0);
        let (master, worker_end) = pipe();
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper {
            detach_on: Some(1),
            ..Upper::default()
        };
        for id in 1..=3 {
            send_task(&master, &TaskMessage::new("x").with_task_id(id));
        }

        let mut rt = runtime(ctx, &mut handler, Some(worker_end), ProtocolType::Task, 256);
        assert_eq!(rt.handle_readable().unwrap(), 3);
        assert!(rt.is_stopping());
        assert_eq!(rt.run(), 0);
        drop(rt);

        assert_eq!(handler.seen, vec![1, 2, 3]);
        let worker = table.slot(0).unwrap();
        assert!(worker.is_detached());
        assert_eq!(worker.request_count(), 1);
    }

    #[test]
    fn test_shared_channel_is_not_drained_after_detach() {
        let table = live_table(0);
        let (master, worker_end) = pipe();
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper {
            detach_on: Some(1),
            ..Upper::default()
        };
        send_task(&master, &TaskMessage::new("x").with_task_id(1));
        send_task(&master, &TaskMessage::new("y").with_task_id(2));

        let mut rt =
            runtime(ctx, &mut handler, Some(worker_end), ProtocolType::Task, 256).shared_channel(true);
        assert_eq!(rt.handle_readable().unwrap(), 1);
        drop(rt);
        assert_eq!(handler.seen, vec![1]);
    }

    #[test]
    fn test_peer_request_answered_on_its_connection() {
        let dir = tempfile::tempdir().unwrap();
        let addr = ListenAddr::Unix(dir.path().join("worker.sock"));
        let listener = Arc::new(Listener::bind(&addr, 8, 4096).unwrap());
        let table = live_table(0);
        let ctx = WorkerContext::new(table.identity(0).unwrap(), table.clone(), None);

        let client_addr = addr.clone();
        let client = std::thread::spawn(move || request(&client_addr, b"shout", 4096).unwrap());

        let mut handler = Upper::default();
        let mut rt = runtime(ctx, &mut handler, None, ProtocolType::Stream, 256)
            .with_listener(Some(listener));
        assert!(rt.listener_fd().is_some());
        let mut served = 0;
        while served == 0 {
            served = rt.turn().unwrap();
        }
        drop(rt);

        assert_eq!(client.join().unwrap(), vec![b"SHOUT".to_vec()]);
        assert_eq!(handler.lengths, vec![5]);
        assert_eq!(table.slot(0).unwrap().response_count(), 1);
    }

    #[test]
    fn test_queue_worker_notices_missing_master() {
        let table = live_table(0);
        let queue = Arc::new(MsgQueue::open(0).unwrap());
        let worker_end: Arc<dyn Channel> = Arc::new(MsgQueueEndpoint::worker(queue));
        let ctx = context(&table, &worker_end, ProtocolType::Task);
        let mut handler = Upper::default();
        let mut rt = WorkerRuntime::new(
            ctx,
            &mut handler,
            Some(worker_end),
            ProtocolType::Task.codec(&settings()),
            256,
            nix::unistd::getppid(),
        )
        .shared_channel(true);
        assert_eq!(rt.readable_fd(), None);

        // The queue is empty, so one turn samples it and comes back quickly.
        let start = std::time::Instant::now();
        assert_eq!(rt.turn().unwrap(), 0);
        assert!(start.elapsed() < POLL_INTERVAL);

        rt.master_pid = Pid::from_raw(1);
        assert_eq!(rt.run(), 1);
    }

    #[test]
    fn test_run_without_channel_fails() {
        let table = live_table(0);
        let ctx = WorkerContext::new(table.identity(0).unwrap(), table.clone(), None);
        let mut handler = Upper::default();
        let mut rt = runtime(ctx, &mut handler, None, ProtocolType::Task, 256);
        assert_eq!(rt.readable_fd(), None);
        assert_eq!(rt.handle_readable().unwrap(), 0);
        assert_eq!(rt.run(), 1);
    }
}
