//! Pool configuration.
//!
//! `PoolConfig` is plain data: it can be built in code, or loaded from a
//! JSON document. Every field has a default, so a config file only needs
//! to name what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipc::IpcMode;
use crate::protocol::{ProtocolType, TASK_HEADER_LEN};

/// Default maximum size of a single IPC packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8192;

/// Default cap on a reassembled message or stream frame (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a [`ProcessPool`](crate::ProcessPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub worker_num: u32,
    /// Logical id of the first worker; worker ids are `start_id + index`.
    pub start_id: u32,
    /// Channel connecting master and workers.
    pub ipc_mode: IpcMode,
    /// Framing used on the channel.
    pub protocol: ProtocolType,
    /// System V queue key for `ipc_mode = msg_queue`. Zero means a private queue.
    pub msgqueue_key: i32,
    /// Largest packet written to the transport in one call.
    pub max_packet_size: usize,
    /// Largest message the stream and message protocols will reassemble.
    pub max_frame_size: usize,
    /// Requests a worker serves before it is recycled. Zero disables recycling.
    pub max_request: u32,
    /// Upper bound of the random extra requests added to `max_request` per worker.
    pub max_request_grace: u32,
    /// Milliseconds a reloading worker gets between SIGTERM and SIGKILL.
    pub reload_timeout_ms: u64,
    /// Minimum milliseconds between two "no idle worker" warnings.
    pub warning_interval_ms: u64,
    /// Directory for spilled task payloads. `None` uses the system temp dir.
    pub tmp_dir: Option<PathBuf>,
    pub redirect_stdin: bool,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_num: 1,
            start_id: 0,
            ipc_mode: IpcMode::UnixSocket,
            protocol: ProtocolType::Task,
            msgqueue_key: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_request: 0,
            max_request_grace: 0,
            reload_timeout_ms: 3000,
            warning_interval_ms: 1000,
            tmp_dir: None,
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for `worker_num` workers with all other fields defaulted.
    pub fn new(worker_num: u32, ipc_mode: IpcMode, protocol: ProtocolType) -> Self {
        Self {
            worker_num,
            ipc_mode,
            protocol,
            ..Self::default()
        }
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check the configuration for values the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_num == 0 {
            return Err(Error::Config("worker_num must be at least 1".to_string()));
        }
        if self.start_id.checked_add(self.worker_num).is_none() {
            return Err(Error::Config("start_id + worker_num overflows".to_string()));
        }
        if self.max_packet_size <= TASK_HEADER_LEN {
            return Err(Error::Config(format!(
                "max_packet_size must exceed the {} byte task header",
                TASK_HEADER_LEN
            )));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be positive".to_string()));
        }
        if !self.ipc_mode.preserves_boundaries() && self.protocol != ProtocolType::Stream {
            return Err(Error::Config(format!(
                "{:?} protocol needs a message-oriented transport, {:?} is a byte stream",
                self.protocol, self.ipc_mode
            )));
        }
        if self.ipc_mode == IpcMode::MsgQueue && self.protocol != ProtocolType::Task {
            return Err(Error::Config(format!(
                "msg_queue delivers each packet to any worker, {:?} packets of one message could be split",
                self.protocol
            )));
        }
        Ok(())
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    pub fn warning_interval(&self) -> Duration {
        Duration::from_millis(self.warning_interval_ms)
    }

    /// Directory used for spilled task payloads.
    pub fn spill_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
