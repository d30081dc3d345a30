//! The process pool: master-side supervision and dispatch.
//!
//! A [`ProcessPool`] forks `worker_num` workers, hands them tasks over the
//! configured transport, reaps and respawns them, and restarts them one by one
//! on [`reload`](ProcessPool::reload).
//!
//! The pool itself is single-threaded. Shared state that workers update (status,
//! counters) lives in a [`WorkerTable`] mapped into shared memory; everything
//! else (pid map, reload bookkeeping, codecs) exists only in the master.

mod handler;
pub(crate) mod process;
mod reload;
mod scheduler;

use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use rustc_hash::FxHashMap;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::ipc::{
    Channel, IpcMode, ListenAddr, Listener, Transport, poll_readable, transport_error, wait_ready,
    write_packets,
};
use crate::protocol::{CodecSettings, FrameCodec, MASTER_ID, ProtocolType, TaskMessage, discard_spilled};
use crate::signals;
use crate::worker::{
    ExitStatus, ProcessRole, Responder, Worker, WorkerContext, WorkerId, WorkerIdentity,
    WorkerRuntime, WorkerTable, redirect_stdio,
};

pub use handler::PoolHandler;
pub use process::{ForkControl, ProcessControl, Spawned};
pub use reload::ReloadTask;
pub use scheduler::{RateLimiter, Scheduler};

/// How long one turn of the master loop waits for replies.
const MASTER_POLL: Duration = Duration::from_millis(100);

/// Sleep between exit checks while shutting down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// A custom worker main loop. Its return value is the worker's exit code.
pub type MainLoop = Box<dyn FnMut(&mut WorkerRuntime<'_>) -> i32>;

/// Lifecycle of the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Where a dispatched task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Written to this worker's endpoint.
    Worker(WorkerId),
    /// Queued for whichever worker reads it first.
    AnyConsumer,
}

/// A message received by the master from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Sender, when the transport or header identifies it.
    pub worker_id: Option<WorkerId>,
    pub message: TaskMessage,
}

/// A process that gave up its slot, tracked until its exit is reaped.
struct DetachedWorker {
    identity: WorkerIdentity,
    /// Its old point-to-point connection, still read for late replies.
    endpoint: Option<(Arc<dyn Channel>, Box<dyn FrameCodec>)>,
}

/// Master-side handle of a pool of forked workers.
pub struct ProcessPool {
    config: PoolConfig,
    table: Arc<WorkerTable>,
    transport: Transport,
    settings: CodecSettings,
    /// One per master endpoint, indexed like the endpoints.
    codecs: Vec<Box<dyn FrameCodec>>,
    /// Stream frames written to a datagram transport are cut to this size.
    segment: Option<usize>,
    handler: Option<Box<dyn PoolHandler>>,
    main_loop: Option<MainLoop>,
    control: Box<dyn ProcessControl>,
    pids: FxHashMap<Pid, usize>,
    detached: FxHashMap<Pid, DetachedWorker>,
    listener: Option<Arc<Listener>>,
    /// Replies read while waiting for room to write, handed out by the next
    /// `poll_replies`.
    backlog: Vec<Reply>,
    scheduler: Scheduler,
    no_idle: RateLimiter,
    reload_task: Option<ReloadTask>,
    reload_count: u64,
    state: PoolState,
    master_pid: Pid,
    recv_buf: Vec<u8>,
}

impl ProcessPool {
    /// Create a pool that forks real processes.
    pub fn create(config: PoolConfig, handler: impl PoolHandler + 'static) -> Result<Self> {
        Self::with_control(config, Box::new(handler), Box::new(ForkControl))
    }

    /// Create a pool that manages processes through `control`.
    pub fn with_control(
        config: PoolConfig,
        handler: Box<dyn PoolHandler>,
        control: Box<dyn ProcessControl>,
    ) -> Result<Self> {
        config.validate()?;
        let worker_num = config.worker_num as usize;
        let table = Arc::new(WorkerTable::shared(config.start_id, worker_num)?);
        let transport = Transport::create(config.ipc_mode, worker_num, config.msgqueue_key)?;
        let settings = CodecSettings::from_config(&config);
        let codecs = transport
            .master_endpoints()
            .map(|_| config.protocol.codec(&settings))
            .collect();
        let segment = (config.protocol == ProtocolType::Stream
            && config.ipc_mode.preserves_boundaries())
        .then_some(config.max_packet_size);

        tracing::info!(
            workers = worker_num,
            ipc_mode = ?config.ipc_mode,
            protocol = ?config.protocol,
            "process pool created"
        );

        Ok(Self {
            no_idle: RateLimiter::new(config.warning_interval()),
            recv_buf: vec![0u8; config.max_packet_size],
            config,
            table,
            transport,
            settings,
            codecs,
            segment,
            handler: Some(handler),
            main_loop: None,
            control,
            pids: FxHashMap::default(),
            detached: FxHashMap::default(),
            listener: None,
            backlog: Vec::new(),
            scheduler: Scheduler::new(),
            reload_task: None,
            reload_count: 0,
            state: PoolState::Created,
            master_pid: nix::unistd::getpid(),
        })
    }

    /// Accept external stream peers on `addr`: `unix:/path`, a socket file
    /// path, or `host:port`. Must be called before [`start`](Self::start);
    /// every worker inherits the socket and answers one request frame per
    /// connection. Returns the bound address (with the real port when `0`
    /// was asked for).
    pub fn listen(&mut self, addr: &str, backlog: i32) -> Result<&ListenAddr> {
        if self.state != PoolState::Created {
            return Err(Error::State(format!("cannot listen, pool is {:?}", self.state)));
        }
        if self.config.protocol != ProtocolType::Stream {
            return Err(Error::Unsupported(format!(
                "listening needs the stream protocol, pool uses {:?}",
                self.config.protocol
            )));
        }
        if self.listener.is_some() {
            return Err(Error::State("pool is already listening".to_string()));
        }
        let addr: ListenAddr = addr.parse()?;
        let listener = Listener::bind(&addr, backlog, self.settings.max_frame_size)?;
        Ok(self.listener.insert(Arc::new(listener)).addr())
    }

    /// Address external peers connect to, once [`listen`](Self::listen) succeeded.
    pub fn listen_addr(&self) -> Option<&ListenAddr> {
        self.listener.as_deref().map(Listener::addr)
    }

    /// Replace the default worker loop. Required when `ipc_mode` is `None`
    /// and the pool does not listen.
    pub fn set_main_loop(&mut self, main_loop: impl FnMut(&mut WorkerRuntime<'_>) -> i32 + 'static) {
        self.main_loop = Some(Box::new(main_loop));
    }

    // --- accessors ---

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.table.get(id)
    }

    pub fn master_pid(&self) -> Pid {
        self.master_pid
    }

    /// Which process is asking: the master, or a worker that inherited the pool.
    pub fn role(&self) -> ProcessRole {
        if nix::unistd::getpid() == self.master_pid {
            ProcessRole::Master
        } else {
            ProcessRole::Worker
        }
    }

    /// Live workers as `(id, pid)`, in slot order.
    pub fn worker_pids(&self) -> Vec<(WorkerId, Pid)> {
        self.table
            .workers()
            .iter()
            .filter_map(|w| w.pid().map(|pid| (w.id(), pid)))
            .collect()
    }

    /// Processes that detached from their slot and have not exited yet.
    pub fn detached_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.detached.keys().copied().collect();
        pids.sort_by_key(|pid| pid.as_raw());
        pids
    }

    fn has_children(&self) -> bool {
        !self.pids.is_empty() || !self.detached.is_empty()
    }

    pub fn is_reloading(&self) -> bool {
        self.reload_task.is_some()
    }

    pub fn reload_task(&self) -> Option<&ReloadTask> {
        self.reload_task.as_ref()
    }

    /// Reloads started since the pool was created.
    pub fn reload_count(&self) -> u64 {
        self.reload_count
    }

    /// "No idle worker" warnings emitted so far.
    pub fn scheduler_warnings(&self) -> u64 {
        self.no_idle.reported()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            PoolState::Running => Ok(()),
            state => Err(Error::State(format!("pool is {:?}", state))),
        }
    }

    /// Run a handler callback with the pool borrowed read-only.
    fn notify<R: Default>(&mut self, f: impl FnOnce(&mut dyn PoolHandler, &ProcessPool) -> R) -> R {
        let Some(mut handler) = self.handler.take() else {
            return R::default();
        };
        let result = f(handler.as_mut(), self);
        self.handler = Some(handler);
        result
    }

    // --- startup ---

    /// Check that the pool can start.
    pub fn start_check(&self) -> Result<()> {
        if self.state != PoolState::Created {
            return Err(Error::State(format!("pool is {:?}", self.state)));
        }
        if self.config.ipc_mode == IpcMode::None && self.main_loop.is_none() && self.listener.is_none() {
            return Err(Error::Config(
                "ipc_mode none needs a main loop (see set_main_loop) or a listening socket".to_string(),
            ));
        }
        if self.handler.is_none() {
            return Err(Error::State("pool has no handler".to_string()));
        }
        Ok(())
    }

    /// Fork every worker.
    pub fn start(&mut self) -> Result<()> {
        self.start_check()?;
        for slot in 0..self.table.len() {
            if let Err(e) = self.spawn(slot) {
                tracing::error!(slot, "failed to start worker: {}", e);
                self.abort_start();
                return Err(e);
            }
        }
        self.state = PoolState::Running;
        tracing::info!(workers = self.pids.len(), master = %self.master_pid, "process pool started");
        self.notify(|h, pool| h.on_start(pool));
        Ok(())
    }

    fn abort_start(&mut self) {
        self.kill_all_workers(Signal::SIGKILL);
        while !self.pids.is_empty() {
            match self.control.wait(true) {
                Ok(Some(status)) => {
                    self.pids.remove(&status.pid());
                }
                _ => break,
            }
        }
        self.pids.clear();
        self.state = PoolState::Stopped;
    }

    /// Fork a process into `slot`. Never returns in the child.
    fn spawn(&mut self, slot: usize) -> Result<Pid> {
        let table = self.table.clone();
        let worker = table
            .slot(slot)
            .ok_or_else(|| Error::State(format!("no worker slot {}", slot)))?;
        worker.reset();
        worker.set_max_request(self.config.max_request, self.config.max_request_grace);

        match self.control.spawn()? {
            Spawned::Child => {
                let code = self.run_worker(slot);
                let _ = io::stdout().flush();
                // SAFETY: `_exit` skips destructors of state owned by the master
                // (the shared table, message queue removal).
                unsafe { libc::_exit(code) }
            }
            Spawned::Parent(pid) => {
                worker.attach(pid);
                self.pids.insert(pid, slot);
                tracing::debug!(worker = worker.id(), %pid, generation = worker.generation(), "worker spawned");
                Ok(pid)
            }
        }
    }

    /// Body of a freshly forked worker process.
    fn run_worker(&mut self, slot: usize) -> i32 {
        if let Err(e) = signals::install_worker_handlers() {
            tracing::error!(slot, "failed to install signal handlers: {}", e);
            return 1;
        }
        if let Err(e) = redirect_stdio(
            self.config.redirect_stdin,
            self.config.redirect_stdout,
            self.config.redirect_stderr,
        ) {
            tracing::error!(slot, "failed to redirect stdio: {}", e);
            return 1;
        }
        let Some(worker) = self.table.slot(slot) else {
            return 1;
        };
        let identity = WorkerIdentity {
            id: worker.id(),
            slot,
            pid: nix::unistd::getpid(),
            generation: worker.generation(),
        };
        let Some(mut handler) = self.handler.take() else {
            return 1;
        };
        let mut main_loop = self.main_loop.take();

        let channel = self.transport.worker(slot).cloned();
        let responder = channel.clone().map(|channel| {
            Responder::new(channel, self.config.protocol.codec(&self.settings), self.segment)
        });
        let ctx = WorkerContext::new(identity, self.table.clone(), responder);
        let mut runtime = WorkerRuntime::new(
            ctx,
            handler.as_mut(),
            channel,
            self.config.protocol.codec(&self.settings),
            self.config.max_packet_size,
            self.master_pid,
        )
        .shared_channel(!self.config.ipc_mode.is_point_to_point())
        .with_listener(self.listener.clone());

        runtime.start();
        let code = match main_loop.as_mut() {
            Some(main_loop) => main_loop(&mut runtime),
            None => runtime.run(),
        };
        runtime.finish();
        code
    }

    // --- dispatch ---

    /// Pick an idle worker round-robin, without claiming it.
    pub fn schedule(&mut self) -> Result<WorkerId> {
        if !self.config.ipc_mode.is_point_to_point() {
            return Err(Error::Unsupported(format!(
                "{:?} transport picks its own consumer",
                self.config.ipc_mode
            )));
        }
        let table = self.table.clone();
        self.select_idle(&table)
            .map(|slot| table.workers()[slot].id())
            .ok_or(Error::NoAvailableWorker)
    }

    /// Round-robin scan for an idle worker, retried once from the wrapped
    /// cursor. The first miss is reported, rate limited.
    fn select_idle(&mut self, table: &WorkerTable) -> Option<usize> {
        let workers = table.workers();
        if let Some(slot) = self.scheduler.select(workers, Worker::is_dispatchable) {
            return Some(slot);
        }
        if self.no_idle.hit(Instant::now()) {
            tracing::warn!(
                workers = workers.len(),
                misses = self.no_idle.total(),
                "no idle worker available"
            );
        }
        self.scheduler.select(workers, Worker::is_dispatchable)
    }

    /// Send a task without blocking.
    ///
    /// Fails with [`Error::NoAvailableWorker`] when every worker is busy and
    /// with [`Error::WouldBlock`] when a shared queue is full.
    pub fn dispatch(&mut self, task: TaskMessage) -> Result<Destination> {
        self.dispatch_with(task, false)
    }

    /// Send a task, waiting for transport room. When no worker is idle the
    /// task queues behind a busy one.
    pub fn dispatch_sync(&mut self, task: TaskMessage) -> Result<Destination> {
        self.dispatch_with(task, true)
    }

    fn dispatch_with(&mut self, task: TaskMessage, blocking: bool) -> Result<Destination> {
        self.ensure_running()?;
        match self.config.ipc_mode {
            IpcMode::None => Err(Error::Unsupported("pool has no IPC channel".to_string())),
            IpcMode::MsgQueue => {
                self.write(0, &task, blocking)?;
                tracing::trace!(task_id = task.task_id, "task queued");
                Ok(Destination::AnyConsumer)
            }
            IpcMode::UnixSocket | IpcMode::StreamSocket => self.dispatch_to_worker(&task, blocking),
        }
    }

    fn dispatch_to_worker(&mut self, task: &TaskMessage, blocking: bool) -> Result<Destination> {
        let table = self.table.clone();
        for _ in 0..table.len() {
            let slot = match self.select_idle(&table) {
                Some(slot) => {
                    if !table.workers()[slot].try_mark_busy() {
                        continue;
                    }
                    slot
                }
                None if blocking => self
                    .scheduler
                    .select(table.workers(), |w| w.is_busy() && !w.has_exceeded_max_request())
                    .ok_or(Error::NoAvailableWorker)?,
                None => return Err(Error::NoAvailableWorker),
            };
            let worker = &table.workers()[slot];
            match self.write(slot, task, blocking) {
                Ok(_) => {
                    worker.add_dispatch_count();
                    tracing::trace!(worker = worker.id(), task_id = task.task_id, "task dispatched");
                    return Ok(Destination::Worker(worker.id()));
                }
                Err(Error::WouldBlock) => {
                    tracing::debug!(worker = worker.id(), "worker endpoint full, trying the next one");
                    worker.mark_idle();
                }
                Err(Error::WorkerGone { worker_id }) => {
                    tracing::warn!(worker = worker_id, "worker endpoint closed, re-routing task");
                    worker.mark_exiting();
                }
                Err(e) => {
                    worker.mark_idle();
                    return Err(e);
                }
            }
        }
        Err(Error::NoAvailableWorker)
    }

    fn endpoint_index(&self, slot: usize) -> usize {
        match self.config.ipc_mode {
            IpcMode::MsgQueue => 0,
            _ => slot,
        }
    }

    /// Encode `message` and write it to the endpoint of `slot`.
    fn write(&mut self, slot: usize, message: &TaskMessage, blocking: bool) -> Result<usize> {
        let index = self.endpoint_index(slot);
        let channel = self
            .transport
            .master(index)
            .cloned()
            .ok_or_else(|| Error::Unsupported("pool has no IPC channel".to_string()))?;
        let codec = self
            .codecs
            .get_mut(index)
            .ok_or_else(|| Error::State(format!("no codec for endpoint {}", index)))?;
        let packets = codec.encode(message)?;

        let segment = self.segment;
        let deadline = Instant::now() + self.config.reload_timeout();
        let result = write_packets(channel.as_ref(), &packets, segment, blocking, &mut || {
            if Instant::now() >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            self.await_room(index)
        });
        result.map_err(|e| {
            if self.config.protocol == ProtocolType::Task {
                packets.iter().for_each(|p| discard_spilled(p));
            }
            let worker_id = self.config.start_id + slot as u32;
            if Error::is_peer_gone(&e) {
                Error::WorkerGone { worker_id }
            } else if e.kind() == io::ErrorKind::TimedOut {
                self.abandon_stalled(slot);
                Error::Transport(format!("worker {} stopped reading tasks", worker_id))
            } else {
                transport_error("dispatch", e)
            }
        })
    }

    /// The endpoint at `index` is full. Read replies meanwhile: a worker
    /// blocked on writing its reply can then go back to reading tasks.
    fn await_room(&mut self, index: usize) -> io::Result<()> {
        let to_io = |e: Error| io::Error::other(e.to_string());
        if !self.config.ipc_mode.is_point_to_point() {
            let replies = self.drain(index).map_err(to_io)?;
            if replies.is_empty() {
                std::thread::sleep(SHUTDOWN_POLL);
            }
            self.backlog.extend(replies);
            return Ok(());
        }

        let channels: Vec<Arc<dyn Channel>> = self
            .transport
            .master_endpoints()
            .map(|(_, channel)| channel.clone())
            .collect();
        let readable = {
            let readers: Vec<BorrowedFd<'_>> = channels.iter().filter_map(|c| c.poll_fd()).collect();
            let writer = channels.get(index).and_then(|c| c.poll_fd());
            wait_ready(&readers, writer, MASTER_POLL)?
        };
        for ready in readable {
            let replies = self.drain(ready).map_err(to_io)?;
            self.backlog.extend(replies);
        }
        Ok(())
    }

    /// A point-to-point worker stopped reading in the middle of a task. Kill
    /// it so its connection is cleared before the replacement starts.
    fn abandon_stalled(&mut self, slot: usize) {
        if !self.config.ipc_mode.is_point_to_point() {
            return;
        }
        let Some(worker) = self.table.slot(slot) else {
            return;
        };
        let Some(pid) = worker.pid() else {
            return;
        };
        tracing::error!(worker = worker.id(), %pid, "worker stalled while receiving a task, killing");
        worker.mark_exiting();
        if let Err(e) = self.control.kill(pid, Signal::SIGKILL) {
            tracing::warn!(worker = worker.id(), "failed to kill stalled worker: {}", e);
        }
    }

    /// Deliver an out-of-band message to one worker's message box.
    pub fn send_message(&mut self, worker_id: WorkerId, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_running()?;
        if !self.config.ipc_mode.is_point_to_point() {
            return Err(Error::Unsupported(format!(
                "message box needs a point-to-point transport, pool uses {:?}",
                self.config.ipc_mode
            )));
        }
        if self.config.protocol == ProtocolType::Stream {
            return Err(Error::Unsupported(
                "stream protocol cannot mark out-of-band messages".to_string(),
            ));
        }
        let slot = self.table.slot_of(worker_id)?;
        let message = TaskMessage::new(payload).out_of_band();
        self.write(slot, &message, true)?;
        Ok(())
    }

    // --- replies ---

    /// Collect replies from workers, waiting up to `timeout` for the first.
    pub fn poll_replies(&mut self, timeout: Duration) -> Result<Vec<Reply>> {
        let mut replies = std::mem::take(&mut self.backlog);
        let timeout = if replies.is_empty() { timeout } else { Duration::ZERO };
        match self.config.ipc_mode {
            IpcMode::None => {
                std::thread::sleep(timeout);
            }
            IpcMode::MsgQueue => {
                let deadline = Instant::now() + timeout;
                loop {
                    replies.extend(self.drain(0)?);
                    let now = Instant::now();
                    if !replies.is_empty() || now >= deadline {
                        break;
                    }
                    std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
                }
            }
            IpcMode::UnixSocket | IpcMode::StreamSocket => {
                let live: Vec<Arc<dyn Channel>> = self
                    .transport
                    .master_endpoints()
                    .map(|(_, channel)| channel.clone())
                    .collect();
                let retired: Vec<(Pid, Arc<dyn Channel>)> = self
                    .detached
                    .iter()
                    .filter_map(|(pid, d)| d.endpoint.as_ref().map(|(c, _)| (*pid, c.clone())))
                    .collect();
                let ready = {
                    let fds: Vec<BorrowedFd<'_>> = live
                        .iter()
                        .chain(retired.iter().map(|(_, channel)| channel))
                        .filter_map(|channel| channel.poll_fd())
                        .collect();
                    poll_readable(&fds, timeout)?
                };
                for index in ready {
                    if index < live.len() {
                        replies.extend(self.drain(index)?);
                    } else if let Some((pid, _)) = retired.get(index - live.len()) {
                        replies.extend(self.drain_detached(*pid)?);
                    }
                }
            }
        }
        Ok(replies)
    }

    /// Read everything queued on one master endpoint.
    fn drain(&mut self, index: usize) -> Result<Vec<Reply>> {
        let Some(channel) = self.transport.master(index).cloned() else {
            return Ok(Vec::new());
        };
        let mut replies = Vec::new();
        for data in read_queued(channel.as_ref(), &mut self.recv_buf, index)? {
            match self.codecs[index].decode(&data) {
                Ok(messages) => {
                    for message in messages {
                        let worker_id = self.reply_source(index, &message);
                        replies.push(Reply { worker_id, message });
                    }
                }
                Err(e) => self.reject_reply(index, e),
            }
        }
        Ok(replies)
    }

    /// Read late replies from a detached process's old connection.
    fn drain_detached(&mut self, pid: Pid) -> Result<Vec<Reply>> {
        let Some(entry) = self.detached.get_mut(&pid) else {
            return Ok(Vec::new());
        };
        let worker_id = Some(entry.identity.id);
        let Some((channel, codec)) = entry.endpoint.as_mut() else {
            return Ok(Vec::new());
        };
        let mut replies = Vec::new();
        for data in read_queued(channel.as_ref(), &mut self.recv_buf, entry.identity.slot)? {
            match codec.decode(&data) {
                Ok(messages) => replies.extend(
                    messages
                        .into_iter()
                        .map(|message| Reply { worker_id, message }),
                ),
                Err(e) => {
                    tracing::warn!(%pid, "dropping malformed reply from detached worker: {}", e);
                    codec.reset();
                }
            }
        }
        Ok(replies)
    }

    fn reply_source(&self, index: usize, message: &TaskMessage) -> Option<WorkerId> {
        if self.config.ipc_mode.is_point_to_point() {
            self.table.slot(index).map(Worker::id)
        } else {
            (message.src_worker_id != MASTER_ID).then_some(message.src_worker_id)
        }
    }

    /// A malformed reply. A byte stream cannot resynchronise, so that worker
    /// is restarted; other protocols just lose the packet.
    fn reject_reply(&mut self, index: usize, err: Error) {
        if self.config.protocol != ProtocolType::Stream {
            tracing::warn!(endpoint = index, "dropping malformed reply: {}", err);
            return;
        }
        tracing::error!(endpoint = index, "reply stream corrupted: {}", err);
        self.codecs[index].reset();
        if let Some(id) = self.table.slot(index).map(Worker::id) {
            if let Err(e) = self.stop(id) {
                tracing::warn!(worker = id, "failed to stop worker: {}", e);
            }
        }
    }

    // --- supervision ---

    /// Ask one worker to exit. It is respawned when its exit is reaped.
    ///
    /// Returns false if the worker has no process or is already exiting.
    pub fn stop(&mut self, worker_id: WorkerId) -> Result<bool> {
        let table = self.table.clone();
        let slot = table.slot_of(worker_id)?;
        let worker = &table.workers()[slot];
        let Some(pid) = worker.pid() else {
            return Ok(false);
        };
        if !worker.mark_exiting() {
            return Ok(false);
        }
        tracing::info!(worker = worker_id, %pid, "stopping worker");
        self.control.kill(pid, Signal::SIGTERM)?;
        Ok(true)
    }

    /// Send `signal` to every live worker, detached ones included, and mark
    /// the slots exiting.
    pub fn kill_all_workers(&mut self, signal: Signal) {
        let targets: Vec<(Pid, usize)> = self.pids.iter().map(|(&pid, &slot)| (pid, slot)).collect();
        for (pid, slot) in targets {
            if let Some(worker) = self.table.slot(slot) {
                worker.mark_exiting();
            }
            if let Err(e) = self.control.kill(pid, signal) {
                tracing::warn!(%pid, ?signal, "failed to signal worker: {}", e);
            }
        }
        for pid in self.detached_pids() {
            if let Err(e) = self.control.kill(pid, signal) {
                tracing::warn!(%pid, ?signal, "failed to signal detached worker: {}", e);
            }
        }
    }

    /// Reap at most one exited worker and react to it.
    pub fn wait_once(&mut self, block: bool) -> Result<Option<ExitStatus>> {
        let status = self.control.wait(block)?;
        if let Some(status) = status {
            self.handle_exit(status);
        }
        Ok(status)
    }

    fn handle_exit(&mut self, status: ExitStatus) {
        let pid = status.pid();
        if let Some(detached) = self.detached.remove(&pid) {
            self.reap_detached(detached, &status);
            return;
        }
        let Some(slot) = self.pids.remove(&pid) else {
            if self.notify(|h, pool| h.on_worker_not_found(pool, &status)) {
                tracing::debug!(%pid, "handler claimed a process the pool does not own: {}", status);
            } else {
                tracing::warn!(%pid, "reaped a process the pool does not own: {}", status);
            }
            return;
        };

        let table = self.table.clone();
        let worker = &table.workers()[slot];
        let identity = WorkerIdentity {
            id: worker.id(),
            slot,
            pid,
            generation: worker.generation(),
        };
        // Workers signalled by stop, reload or recycling are already Exiting.
        let expected =
            worker.is_exiting() || self.state != PoolState::Running || status.is_success();
        worker.mark_reaped();
        if self.config.ipc_mode.is_point_to_point() {
            self.resync_endpoint(slot, &status);
        }

        if expected {
            tracing::info!(worker = identity.id, "worker exited: {}", status);
            self.notify(|h, pool| h.on_worker_exit(pool, &identity, &status));
        } else {
            tracing::warn!(worker = identity.id, "worker crashed: {}", status);
            self.notify(|h, pool| h.on_worker_error(pool, &identity, &status));
        }

        let reload_member = self.reload_task.as_mut().is_some_and(|t| t.remove(pid));

        if self.state == PoolState::Running {
            match self.spawn(slot) {
                Ok(new_pid) => tracing::info!(worker = identity.id, pid = %new_pid, "worker respawned"),
                Err(e) => tracing::error!(worker = identity.id, "failed to respawn worker: {}", e),
            }
        }

        if reload_member {
            self.advance_reload();
        }
    }

    /// Settle a worker's connection before its slot is reused. Complete
    /// replies are kept and a half-received one is dropped. On a byte stream
    /// a worker that died abnormally may have read part of a task, so the
    /// unread task bytes are dropped too; the replacement then starts on a
    /// frame boundary.
    fn resync_endpoint(&mut self, slot: usize, status: &ExitStatus) {
        match self.drain(slot) {
            Ok(replies) => self.backlog.extend(replies),
            Err(e) => tracing::warn!(endpoint = slot, "failed to read final replies: {}", e),
        }
        if let Some(codec) = self.codecs.get_mut(slot) {
            if codec.is_mid_frame() {
                tracing::warn!(endpoint = slot, "dropping a partial reply from the exited worker");
            }
            codec.reset();
        }
        if self.config.protocol == ProtocolType::Stream && !status.is_success() {
            let dropped = self
                .transport
                .worker(slot)
                .map_or(0, |channel| discard_queued(channel.as_ref()));
            if dropped > 0 {
                tracing::warn!(endpoint = slot, bytes = dropped, "dropping unread task bytes");
            }
        }
    }

    fn reap_detached(&mut self, detached: DetachedWorker, status: &ExitStatus) {
        let DetachedWorker { identity, endpoint } = detached;
        if let Some((channel, mut codec)) = endpoint {
            match read_queued(channel.as_ref(), &mut self.recv_buf, identity.slot) {
                Ok(reads) => {
                    for data in reads {
                        match codec.decode(&data) {
                            Ok(messages) => self.backlog.extend(messages.into_iter().map(|message| Reply {
                                worker_id: Some(identity.id),
                                message,
                            })),
                            Err(e) => {
                                tracing::warn!(pid = %identity.pid, "dropping malformed reply: {}", e);
                                codec.reset();
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(pid = %identity.pid, "failed to read final replies: {}", e),
            }
        }
        tracing::info!(worker = identity.id, pid = %identity.pid, "detached worker exited: {}", status);
        self.notify(|h, pool| h.on_worker_exit(pool, &identity, status));
        if self.reload_task.as_mut().is_some_and(|t| t.remove(identity.pid)) {
            self.advance_reload();
        }
    }

    /// A worker gave up its slot: move the process aside and start its
    /// replacement. Point-to-point replacements get a fresh connection, so the
    /// old process can finish reading what was already sent to it.
    fn replace_detached(&mut self, slot: usize) {
        let table = self.table.clone();
        let worker = &table.workers()[slot];
        let Some(pid) = worker.pid() else {
            return;
        };
        let endpoint = if self.config.ipc_mode.is_point_to_point() {
            match self.transport.renew(slot) {
                Ok(old) => {
                    let fresh = self.config.protocol.codec(&self.settings);
                    self.codecs
                        .get_mut(slot)
                        .map(|codec| (old.master, std::mem::replace(codec, fresh)))
                }
                Err(e) => {
                    tracing::error!(worker = worker.id(), "cannot renew endpoint, stopping instead: {}", e);
                    worker.mark_exiting();
                    return;
                }
            }
        } else {
            None
        };

        self.pids.remove(&pid);
        let identity = WorkerIdentity {
            id: worker.id(),
            slot,
            pid,
            generation: worker.generation(),
        };
        self.detached.insert(pid, DetachedWorker { identity, endpoint });
        tracing::info!(worker = identity.id, %pid, "worker detached, starting its replacement");
        match self.spawn(slot) {
            Ok(new_pid) => tracing::info!(worker = identity.id, pid = %new_pid, "replacement started"),
            Err(e) => tracing::error!(worker = identity.id, "failed to start replacement: {}", e),
        }
    }

    fn advance_reload(&mut self) {
        let Some(task) = self.reload_task.as_mut() else {
            return;
        };
        if task.is_completed() {
            self.reload_task = None;
            tracing::info!(reload = self.reload_count, "reload finished");
            self.notify(|h, pool| h.on_after_reload(pool));
            return;
        }
        task.kill_one(self.control.as_mut(), &self.table, Instant::now());
    }

    /// Timer work: reload escalation, request-limit recycling, replacing
    /// detached workers and retrying failed respawns.
    pub fn tick(&mut self, now: Instant) {
        if let Some(task) = self.reload_task.as_mut() {
            task.check_timeout(self.control.as_mut(), now);
        }
        if self.state != PoolState::Running {
            return;
        }

        let table = self.table.clone();
        for (slot, worker) in table.workers().iter().enumerate() {
            if worker.pid().is_none() {
                if let Err(e) = self.spawn(slot) {
                    tracing::error!(worker = worker.id(), "failed to respawn worker: {}", e);
                }
                continue;
            }
            if worker.is_detached() {
                self.replace_detached(slot);
                continue;
            }
            if worker.is_idle() && worker.has_exceeded_max_request() {
                tracing::info!(
                    worker = worker.id(),
                    requests = worker.request_count(),
                    "recycling worker after max_request"
                );
                if let Err(e) = self.stop(worker.id()) {
                    tracing::warn!(worker = worker.id(), "failed to recycle worker: {}", e);
                }
            }
        }
    }

    /// Start a rolling restart of every live worker.
    ///
    /// Returns false when nothing was started: the pool is not running, a
    /// reload is already in progress, or there are no live workers.
    pub fn reload(&mut self) -> bool {
        if self.state != PoolState::Running {
            tracing::warn!(state = ?self.state, "reload ignored, pool is not running");
            return false;
        }
        if self.reload_task.is_some() {
            tracing::info!("reload already in progress");
            return false;
        }

        let table = self.table.clone();
        let workers: Vec<(Pid, usize)> = table
            .workers()
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.is_exiting())
            .filter_map(|(slot, w)| w.pid().map(|pid| (pid, slot)))
            .collect();
        if workers.is_empty() {
            return false;
        }

        self.notify(|h, pool| h.on_before_reload(pool));
        self.reload_count += 1;
        tracing::info!(reload = self.reload_count, workers = workers.len(), "reload started");

        let mut task = ReloadTask::new(self.config.reload_timeout());
        task.add_workers(workers);
        task.kill_one(self.control.as_mut(), &table, Instant::now());
        self.reload_task = Some(task);
        true
    }

    /// The master loop: handle signals, replies, exits and timers until a
    /// stop is requested, then shut down.
    pub fn wait(&mut self) -> Result<()> {
        self.ensure_running()?;
        signals::install_master_handlers()?;
        while self.state == PoolState::Running {
            if signals::stop_requested() {
                tracing::info!("stop requested");
                break;
            }
            if signals::take_reload_request() {
                self.reload();
            }
            for reply in self.poll_replies(MASTER_POLL)? {
                self.notify(|h, pool| h.on_message(pool, reply.worker_id, reply.message));
            }
            while self.wait_once(false)?.is_some() {}
            self.tick(Instant::now());
        }
        self.shutdown()
    }

    /// Stop every worker and wait for them, escalating to SIGKILL after
    /// `reload_timeout`.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            PoolState::Created => {
                self.state = PoolState::Stopped;
                return Ok(());
            }
            PoolState::ShuttingDown | PoolState::Stopped => return Ok(()),
            PoolState::Running => {}
        }
        self.state = PoolState::ShuttingDown;
        tracing::info!(workers = self.pids.len(), "shutting down");

        if let Some(mut task) = self.reload_task.take() {
            tracing::warn!(pending = task.count(), "shutdown interrupts reload");
            task.kill_all(self.control.as_mut(), Signal::SIGKILL);
        }
        self.kill_all_workers(Signal::SIGTERM);

        let deadline = Instant::now() + self.config.reload_timeout();
        while self.has_children() && Instant::now() < deadline {
            if self.wait_once(false)?.is_none() {
                std::thread::sleep(SHUTDOWN_POLL);
            }
        }
        if self.has_children() {
            tracing::warn!(
                remaining = self.pids.len() + self.detached.len(),
                "workers ignored SIGTERM, killing"
            );
            self.kill_all_workers(Signal::SIGKILL);
            while self.has_children() {
                if self.wait_once(true)?.is_none() {
                    break;
                }
            }
            self.pids.clear();
            self.detached.clear();
        }

        self.state = PoolState::Stopped;
        self.notify(|h, pool| h.on_shutdown(pool));
        tracing::info!("process pool stopped");
        Ok(())
    }

    /// Shut down and release the pool.
    pub fn destroy(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if !self.has_children() || self.role() != ProcessRole::Master {
            return;
        }
        tracing::debug!(workers = self.pids.len(), "pool dropped with live workers, killing");
        self.kill_all_workers(Signal::SIGKILL);
        while self.has_children() {
            match self.control.wait(true) {
                Ok(Some(status)) => {
                    self.pids.remove(&status.pid());
                    self.detached.remove(&status.pid());
                }
                _ => break,
            }
        }
    }
}

/// Read everything currently queued on `channel`, one entry per read.
fn read_queued(channel: &dyn Channel, buf: &mut [u8], endpoint: usize) -> Result<Vec<Vec<u8>>> {
    let mut reads = Vec::new();
    loop {
        match channel.try_recv(buf) {
            Ok(n) => reads.push(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if Error::is_peer_gone(&e) || e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(endpoint, "reply endpoint closed: {}", e);
                break;
            }
            Err(e) => return Err(transport_error("reply recv", e)),
        }
    }
    Ok(reads)
}

/// Throw away whatever is queued on `channel`; returns the byte count.
fn discard_queued(channel: &dyn Channel) -> usize {
    let mut buf = vec![0u8; 64 * 1024];
    let mut dropped = 0;
    loop {
        match channel.try_recv(&mut buf) {
            Ok(n) => dropped += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return dropped,
        }
    }
}
