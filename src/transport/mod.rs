// # Child Transports
//
// Bidirectional framed message channels between the manager and one child
// execution unit. Two variants share the contract:
//
// - `process`: a forked child process, envelopes framed as
//   newline-delimited JSON over the child's stdio pipes
// - `worker`: an in-process execution unit with shared-nothing message
//   passing over unbounded channels
//
// Both deliver whole messages in FIFO order per direction and surface peer
// death as exactly one `Exit` event, after all buffered messages.

pub mod process;
pub mod worker;

pub use process::{ProcessTransport, StdioTransport};
pub use worker::{WorkerChannel, WorkerChildTransport, WorkerData, WorkerLauncher, WorkerTransport};

use crate::error::Result;
use crate::message::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Events surfaced by a transport to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A whole inbound envelope.
    Message(Envelope),
    /// The peer is gone. Fired exactly once per transport.
    Exit { code: Option<i32> },
    /// A recoverable channel error; the transport stays attached.
    Error(String),
}

/// Receiving half handed to the transport owner at construction.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending surface of a live child channel.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Queues one envelope for delivery. Resolution means the local side
    /// accepted the write, not that peer code observed it.
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Terminates the peer. Idempotent.
    async fn kill(&self);

    fn is_alive(&self) -> bool;
}

/// Process-variant spawn knobs, applied where the platform supports them.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Arguments passed to the child program.
    pub args: Vec<String>,
    /// Base environment for the child.
    pub env: HashMap<String, String>,
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Overrides the program path while keeping `file` as argv convention.
    pub exec_path: Option<PathBuf>,
    #[cfg(unix)]
    pub uid: Option<u32>,
    #[cfg(unix)]
    pub gid: Option<u32>,
    /// Discards the child's stderr instead of inheriting it.
    pub silent: bool,
    /// Places the child in its own process group.
    pub detached: bool,
    /// Per-cluster environment overrides, applied after `env`.
    pub cluster_data: HashMap<String, String>,
}
