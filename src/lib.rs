// RustyCluster - Enterprise-grade cluster supervisor and IPC fabric
// Core library module

pub mod client;
pub mod cluster;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod manager;
pub mod message;
pub mod promise;
pub mod queue;
pub mod script;
pub mod transport;

pub use client::{ClientEvalOptions, ClusterClient, ClusterInfo};
pub use cluster::Cluster;
pub use error::{ClusterError, Result};
pub use events::{EventBus, EventKind, EventPayload, HandlerId};
pub use heartbeat::KeepAliveConfig;
pub use manager::{
    BroadcastEvalOptions, ClusterEvalOptions, ClusterManager, ClusterManagerOptions, ClusterMode,
    FetchOptions, RespawnOptions,
};
pub use message::{ClusterId, Envelope, ErrorPayload, IpcMessage, ShardId};
pub use queue::QueueMode;
pub use script::{CommandScriptHost, ScriptHost};
pub use transport::{SpawnOptions, Transport, WorkerChannel, WorkerData, WorkerLauncher};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
