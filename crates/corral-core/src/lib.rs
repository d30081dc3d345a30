//! Core engine for the corral multi-process worker pool.
//!
//! This crate provides:
//! - A master/worker process pool with supervision and respawn
//! - IPC transports (datagram socketpairs, stream socketpairs, System V queues)
//! - Task, message and stream framing protocols
//! - Round-robin dispatch over a shared-memory worker table
//! - Rolling reload with SIGTERM/SIGKILL escalation

pub mod config;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod protocol;
pub mod signals;
pub mod worker;

mod shm;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use ipc::{Channel, IpcMode, ListenAddr, Transport};
pub use pool::{
    Destination, ForkControl, MainLoop, PoolHandler, PoolState, ProcessControl, ProcessPool,
    ReloadTask, Reply, Spawned,
};
pub use protocol::{FrameCodec, ProtocolType, StreamCodec, TaskMessage, encode_stream_frame};
pub use worker::{
    ExitStatus, ProcessRole, Worker, WorkerContext, WorkerId, WorkerIdentity, WorkerRuntime,
    WorkerStatus, WorkerTable,
};
