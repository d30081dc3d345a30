//! Error types for corral-core.

use thiserror::Error;

/// Result type for corral-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in corral-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (send/recv on an IPC endpoint).
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport cannot accept more data right now.
    #[error("transport would block")]
    WouldBlock,

    /// A frame violated the wire protocol. Fatal to the endpoint that produced it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Failed to spill an oversized task payload to (or load it from) a temporary file.
    #[error("task spill error: {0}")]
    Spill(String),

    /// No idle worker could be selected for dispatch.
    #[error("no available worker")]
    NoAvailableWorker,

    /// The destination worker's peer endpoint is gone.
    #[error("worker {worker_id} is gone")]
    WorkerGone { worker_id: u32 },

    /// Spawning, signalling or reaping a process failed.
    #[error("process error: {0}")]
    Process(String),

    /// The operation is not supported by the pool's transport or protocol.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The pool is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    State(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the same operation later.
    ///
    /// Scheduling exhaustion and peer-gone conditions are transient: the pool
    /// respawns workers and the next attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoAvailableWorker | Error::WorkerGone { .. } | Error::WouldBlock
        )
    }

    /// Whether the error indicates the remote endpoint has gone away.
    pub(crate) fn is_peer_gone(err: &std::io::Error) -> bool {
        use std::io::ErrorKind;
        matches!(
            err.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::NotConnected
        ) || err.raw_os_error() == Some(libc::EIDRM)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Process(errno.desc().to_string())
    }
}
