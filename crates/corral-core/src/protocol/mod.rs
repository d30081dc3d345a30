//! Wire framing for task messages.
//!
//! Every pool moves the same logical unit, a [`TaskMessage`], across its
//! transport. How it crosses is decided once per pool by a [`FrameCodec`]:
//!
//! - **Task** ([`TaskCodec`]) - one message is one packet. Payloads that do not
//!   fit in `max_packet_size` are written to a temporary file and only the
//!   header plus the file path is sent.
//! - **Message** ([`MessageCodec`]) - a message is split into chunks sharing a
//!   message id; the receiver reassembles them and yields the message once the
//!   END chunk arrives.
//! - **Stream** ([`StreamCodec`]) - a 4-byte big-endian length prefix followed
//!   by the payload. This is the byte-exact format external peers speak.
//!
//! # Task header layout
//!
//! ```text
//! offset  size  field
//!      0     8  task_id        (u64 LE)
//!      8     8  msg_id         (u64 LE, chunk group for the message protocol)
//!     16     4  src_worker_id  (u32 LE, MASTER_ID when sent by the master)
//!     20     4  len            (u32 LE, bytes of payload that follow)
//!     24     1  flags
//!     25     7  reserved (zero)
//! ```

mod message;
mod stream;
mod task;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

pub use message::MessageCodec;
pub use stream::{StreamCodec, encode_stream_frame};
pub use task::TaskCodec;
pub(crate) use task::discard_spilled;

/// Size of the fixed task header in bytes.
pub const TASK_HEADER_LEN: usize = 32;

/// `src_worker_id` used for messages originating in the master process.
pub const MASTER_ID: u32 = u32::MAX;

/// Header flag bits.
pub mod flags {
    /// Payload was written to a temporary file; the packet carries its path.
    pub const SPILLED: u8 = 0x01;
    /// Packet is one chunk of a larger message.
    pub const CHUNK: u8 = 0x02;
    /// First chunk of a message.
    pub const BEGIN: u8 = 0x04;
    /// Last chunk of a message.
    pub const END: u8 = 0x08;
    /// Out-of-band message for the worker's message box, not a task.
    pub const OUT_OF_BAND: u8 = 0x10;
}

/// Framing protocol selected for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Task,
    Stream,
    Message,
}

/// Limits shared by all codecs, derived from the pool configuration.
#[derive(Debug, Clone)]
pub struct CodecSettings {
    pub max_packet_size: usize,
    pub max_frame_size: usize,
    pub spill_dir: PathBuf,
}

impl CodecSettings {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            max_frame_size: config.max_frame_size,
            spill_dir: config.spill_dir(),
        }
    }
}

impl ProtocolType {
    /// Build a fresh codec for this protocol.
    ///
    /// Each endpoint owns its own codec so partial state (reassembly buffers,
    /// half-read stream frames) never leaks between endpoints.
    pub fn codec(self, settings: &CodecSettings) -> Box<dyn FrameCodec> {
        match self {
            ProtocolType::Task => Box::new(TaskCodec::new(settings.clone())),
            ProtocolType::Stream => Box::new(StreamCodec::new(settings.max_frame_size)),
            ProtocolType::Message => Box::new(MessageCodec::new(
                settings.max_packet_size,
                settings.max_frame_size,
            )),
        }
    }
}

/// Turns task messages into wire packets and back.
pub trait FrameCodec: Send {
    fn protocol(&self) -> ProtocolType;

    /// Encode a message into the packets to write, in order.
    fn encode(&mut self, message: &TaskMessage) -> Result<Vec<Vec<u8>>>;

    /// Feed bytes received from the transport; returns every message completed by them.
    ///
    /// For packet-oriented protocols `data` must be exactly one packet.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<TaskMessage>>;

    /// Drop any partially received state.
    fn reset(&mut self) {}

    /// Whether part of a message has been received but not yet completed.
    fn is_mid_frame(&self) -> bool {
        false
    }
}

/// Fixed-size header preceding every task and message packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskHeader {
    pub task_id: u64,
    pub msg_id: u64,
    pub src_worker_id: u32,
    pub len: u32,
    pub flags: u8,
}

impl TaskHeader {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.task_id.to_le_bytes());
        out.extend_from_slice(&self.msg_id.to_le_bytes());
        out.extend_from_slice(&self.src_worker_id.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.push(self.flags);
        out.extend_from_slice(&[0u8; 7]);
    }

    /// Split a packet into its header and payload, checking that the declared
    /// length matches the bytes present.
    pub fn parse(packet: &[u8]) -> Result<(TaskHeader, &[u8])> {
        if packet.len() < TASK_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "packet of {} bytes is shorter than the task header",
                packet.len()
            )));
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&packet[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&packet[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let header = TaskHeader {
            task_id: u64_at(0),
            msg_id: u64_at(8),
            src_worker_id: u32_at(16),
            len: u32_at(20),
            flags: packet[24],
        };
        let payload = &packet[TASK_HEADER_LEN..];
        if header.len as usize != payload.len() {
            return Err(Error::Protocol(format!(
                "header declares {} payload bytes, packet carries {}",
                header.len,
                payload.len()
            )));
        }
        Ok((header, payload))
    }
}

/// The unit of work moved between master and workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Caller-chosen task identifier, echoed back in replies.
    pub task_id: u64,
    /// Logical id of the sending worker, or [`MASTER_ID`].
    pub src_worker_id: u32,
    /// Message-box delivery rather than a task.
    pub out_of_band: bool,
    pub payload: Vec<u8>,
}

impl TaskMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_id: 0,
            src_worker_id: MASTER_ID,
            out_of_band: false,
            payload: payload.into(),
        }
    }

    pub fn with_task_id(mut self, task_id: u64) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_source(mut self, src_worker_id: u32) -> Self {
        self.src_worker_id = src_worker_id;
        self
    }

    /// Mark the message for the worker's message box.
    pub fn out_of_band(mut self) -> Self {
        self.out_of_band = true;
        self
    }

    pub(crate) fn base_flags(&self) -> u8 {
        if self.out_of_band { flags::OUT_OF_BAND } else { 0 }
    }
}
