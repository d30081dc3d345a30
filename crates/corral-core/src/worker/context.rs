//! Per-process worker context.

use std::sync::Arc;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::{Channel, PeerConnection, transport_error, wait_writable, write_packets};
use crate::protocol::{FrameCodec, TaskMessage};
use crate::signals;

use super::{Worker, WorkerIdentity, WorkerTable};

/// Which side of the fork the current process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Master,
    Worker,
}

/// How long a blocked reply waits for room before trying again.
const REPLY_WAIT: Duration = Duration::from_millis(100);

/// Writes replies from a worker back to the master.
pub struct Responder {
    channel: Arc<dyn Channel>,
    codec: Box<dyn FrameCodec>,
    segment: Option<usize>,
}

impl Responder {
    /// `segment` is set when stream frames must be cut to fit datagram packets.
    pub fn new(channel: Arc<dyn Channel>, codec: Box<dyn FrameCodec>, segment: Option<usize>) -> Self {
        Self {
            channel,
            codec,
            segment,
        }
    }

    /// Encode and write one message, blocking until it is fully out.
    pub fn send(&mut self, message: &TaskMessage) -> Result<usize> {
        let packets = self.codec.encode(message)?;
        let channel = self.channel.as_ref();
        write_packets(channel, &packets, self.segment, true, &mut || {
            wait_writable(channel, REPLY_WAIT)
        })
        .map_err(|e| transport_error("reply", e))
    }
}

/// Everything a task handler can reach from inside a worker process.
///
/// One context exists per worker process. It is built after `fork` and is
/// never shared with the master.
pub struct WorkerContext {
    identity: WorkerIdentity,
    table: Arc<WorkerTable>,
    responder: Option<Responder>,
    peer: Option<PeerConnection>,
    current_task: Option<u64>,
    stop_requested: bool,
    detached: bool,
}

impl WorkerContext {
    pub fn new(identity: WorkerIdentity, table: Arc<WorkerTable>, responder: Option<Responder>) -> Self {
        Self {
            identity,
            table,
            responder,
            peer: None,
            current_task: None,
            stop_requested: false,
            detached: false,
        }
    }

    pub fn role(&self) -> ProcessRole {
        ProcessRole::Worker
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub fn id(&self) -> u32 {
        self.identity.id
    }

    /// This worker's shared descriptor. After [`detach`](Self::detach) the
    /// slot belongs to the replacement process.
    pub fn worker(&self) -> &Worker {
        &self.table.workers()[self.identity.slot]
    }

    /// The whole worker table, including siblings.
    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    /// Id of the task being handled, if any.
    pub fn current_task(&self) -> Option<u64> {
        self.current_task
    }

    pub(crate) fn begin_task(&mut self, task_id: u64) {
        self.current_task = Some(task_id);
    }

    pub(crate) fn end_task(&mut self) {
        self.current_task = None;
    }

    pub(crate) fn set_peer(&mut self, peer: PeerConnection) {
        self.peer = Some(peer);
    }

    pub(crate) fn take_peer(&mut self) -> Option<PeerConnection> {
        self.peer.take()
    }

    /// Reply to the task being handled.
    ///
    /// Requests that came from an external peer are answered on that peer's
    /// connection as stream frames; everything else goes back to the master.
    pub fn response(&mut self, payload: impl Into<Vec<u8>>) -> Result<usize> {
        let task_id = self.current_task.unwrap_or(0);
        self.response_to(task_id, payload)
    }

    /// Send a reply tagged with an explicit task id.
    pub fn response_to(&mut self, task_id: u64, payload: impl Into<Vec<u8>>) -> Result<usize> {
        let payload = payload.into();
        let written = if let Some(peer) = self.peer.as_mut() {
            peer.send_frame(&payload)?
        } else {
            let message = TaskMessage::new(payload)
                .with_task_id(task_id)
                .with_source(self.identity.id);
            let responder = self
                .responder
                .as_mut()
                .ok_or_else(|| Error::Unsupported("pool has no reply channel".to_string()))?;
            responder.send(&message)?
        };
        if !self.detached {
            self.worker().add_response_count();
        }
        Ok(written)
    }

    /// Give this worker's slot to a replacement process.
    ///
    /// The master starts the replacement without waiting for this process,
    /// which stops reading new tasks, finishes what it already has and exits.
    /// Its exit is reaped without a respawn. Fails if the worker is already
    /// being stopped.
    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        if !self.worker().mark_detached() {
            return Err(Error::State(format!("worker {} is already exiting", self.identity.id)));
        }
        self.detached = true;
        self.stop_requested = true;
        tracing::info!(worker = self.identity.id, pid = %self.identity.pid, "worker detached");
        Ok(())
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Leave the worker loop once the current task is done.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Whether the loop should end, by request or by SIGTERM.
    pub fn is_stopping(&self) -> bool {
        self.stop_requested || signals::stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::PipeEndpoint;
    use crate::protocol::{CodecSettings, ProtocolType};
    use nix::unistd::Pid;

    fn context_with_pipe() -> (WorkerContext, PipeEndpoint) {
        let table = Arc::new(WorkerTable::local(3, 1));
        table.slot(0).unwrap().reset();
        table.slot(0).unwrap().attach(Pid::from_raw(500));
        let identity = table.identity(0).unwrap();

        let (master, worker) = PipeEndpoint::pair().unwrap();
        let settings = CodecSettings {
            max_packet_size: 256,
            max_frame_size: 4096,
            spill_dir: std::env::temp_dir(),
        };
        let responder = Responder::new(Arc::new(worker), ProtocolType::Task.codec(&settings), None);
        (WorkerContext::new(identity, table, Some(responder)), master)
    }

    #[test]
    fn test_response_carries_task_and_source() {
        let (mut ctx, master) = context_with_pipe();
        ctx.begin_task(41);
        ctx.response("done").unwrap();
        ctx.end_task();
        assert_eq!(ctx.worker().response_count(), 1);

        let mut buf = [0u8; 256];
        let n = master.try_recv(&mut buf).unwrap();
        let settings = CodecSettings {
            max_packet_size: 256,
            max_frame_size: 4096,
            spill_dir: std::env::temp_dir(),
        };
        let mut codec = ProtocolType::Task.codec(&settings);
        let messages = codec.decode(&buf[..n]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, 41);
        assert_eq!(messages[0].src_worker_id, 3);
        assert_eq!(messages[0].payload, b"done");
    }

    #[test]
    fn test_response_without_channel() {
        let table = Arc::new(WorkerTable::local(0, 1));
        table.slot(0).unwrap().reset();
        table.slot(0).unwrap().attach(Pid::from_raw(9));
        let identity = table.identity(0).unwrap();
        let mut ctx = WorkerContext::new(identity, table, None);
        assert!(matches!(ctx.response("x"), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_detach_hands_over_slot() {
        let (mut ctx, master) = context_with_pipe();
        ctx.worker().try_mark_busy();
        ctx.detach().unwrap();
        assert!(ctx.is_detached());
        assert!(ctx.is_stopping());
        assert!(ctx.worker().is_detached());
        ctx.detach().unwrap();

        // Replies still reach the master but no longer count against the slot.
        ctx.response_to(8, "late").unwrap();
        assert_eq!(ctx.worker().response_count(), 0);
        let mut buf = [0u8; 256];
        assert!(master.try_recv(&mut buf).unwrap() > 0);
    }

    #[test]
    fn test_detach_refused_while_exiting() {
        let (mut ctx, _master) = context_with_pipe();
        ctx.worker().mark_exiting();
        assert!(matches!(ctx.detach(), Err(Error::State(_))));
        assert!(!ctx.is_detached());
    }

    #[test]
    fn test_stop_request() {
        let (mut ctx, _master) = context_with_pipe();
        assert_eq!(ctx.role(), ProcessRole::Worker);
        ctx.stop();
        assert!(ctx.is_stopping());
    }
}
