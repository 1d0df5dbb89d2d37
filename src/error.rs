use crate::message::{ClusterId, ErrorPayload};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster {0} already has a live child")]
    ProcessExists(ClusterId),

    #[error("cluster {0} has no running child")]
    NoChildExists(ClusterId),

    #[error("cluster {0} disconnected before signalling ready")]
    ReadyDisconnected(ClusterId),

    #[error("cluster {0} died before signalling ready")]
    ReadyDied(ClusterId),

    #[error("cluster {0} did not signal ready within {1:?}")]
    ReadyTimeout(ClusterId, Duration),

    #[error("broadcast eval request timed out")]
    BroadcastEvalRequestTimedOut,

    #[error("eval request timed out")]
    EvalRequestTimedOut,

    #[error("no target cluster could be resolved for the request")]
    TargetClusterNotProvided,

    #[error("invalid script: {0}")]
    InvalidScript(String),

    #[error("failed to deliver heartbeat ack to cluster {0}: {1}")]
    AckDeliveryFailed(ClusterId, String),

    #[error("spawn queue is in auto mode; manual advance is not permitted")]
    SpawnQueueAuto,

    #[error("CLUSTER_MANAGER_MODE is missing or invalid; process was not launched by a cluster manager")]
    NoChildOrMasterOrBadMode,

    #[error("remote error: {0}")]
    Remote(ErrorPayload),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Name used when this error crosses the IPC boundary as an `_error`
    /// payload.
    pub fn wire_name(&self) -> &str {
        match self {
            ClusterError::ProcessExists(_) => "ProcessExists",
            ClusterError::NoChildExists(_) => "NoChildExists",
            ClusterError::ReadyDisconnected(_) => "ReadyDisconnected",
            ClusterError::ReadyDied(_) => "ReadyDied",
            ClusterError::ReadyTimeout(_, _) => "ReadyTimeout",
            ClusterError::BroadcastEvalRequestTimedOut => "BroadcastEvalRequestTimedOut",
            ClusterError::EvalRequestTimedOut => "EvalRequestTimedOut",
            ClusterError::TargetClusterNotProvided => "TargetClusterNotProvided",
            ClusterError::InvalidScript(_) => "InvalidScript",
            ClusterError::AckDeliveryFailed(_, _) => "AckDeliveryFailed",
            ClusterError::SpawnQueueAuto => "SpawnQueueAuto",
            ClusterError::NoChildOrMasterOrBadMode => "NoChildOrMasterOrBadMode",
            ClusterError::Remote(payload) => payload.name.as_str(),
            ClusterError::Transport(_) => "TransportError",
            ClusterError::InvalidConfig(_) => "InvalidConfig",
            ClusterError::Serialization(_) => "SerializationError",
            ClusterError::Io(_) => "IoError",
            ClusterError::Internal(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
