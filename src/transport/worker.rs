// # Worker Transport
//
// In-process execution units with shared-nothing message passing: the
// manager and the worker each hold one end of a pair of unbounded
// channels. The manager hands the worker end to a `WorkerLauncher`
// together with the structured bootstrap data (the process-mode
// environment block, as a value).

use super::{Transport, TransportEvent, TransportEvents};
use crate::error::{ClusterError, Result};
use crate::message::{ClusterId, Envelope, ShardId};
use crate::queue::QueueMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Structured bootstrap block delivered to a worker, mirroring the
/// process-mode environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerData {
    pub cluster_id: ClusterId,
    pub shard_list: Vec<ShardId>,
    pub total_shards: u32,
    pub cluster_count: u32,
    pub keep_alive_interval_ms: u64,
    pub queue_mode: QueueMode,
    /// Application-defined variables (credentials and the like).
    pub env: HashMap<String, String>,
}

/// Worker end of the duplex, handed to the launcher. The raw channel
/// halves are public so harnesses can drive the wire protocol directly;
/// ordinary workers wrap the channel in a `ClusterClient`.
pub struct WorkerChannel {
    pub data: WorkerData,
    pub to_parent: mpsc::UnboundedSender<Envelope>,
    pub from_parent: mpsc::UnboundedReceiver<Envelope>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("cluster_id", &self.data.cluster_id)
            .finish()
    }
}

/// Starts worker code when the manager spawns a cluster in worker mode.
/// Implementations typically `tokio::spawn` the worker body.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, channel: WorkerChannel);
}

impl<F> WorkerLauncher for F
where
    F: Fn(WorkerChannel) + Send + Sync,
{
    fn launch(&self, channel: WorkerChannel) {
        self(channel)
    }
}

/// Manager-side handle to a worker.
pub struct WorkerTransport {
    to_child: parking_lot::Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    exited: Arc<AtomicBool>,
}

impl WorkerTransport {
    /// Builds the duplex: the manager keeps the transport and the event
    /// stream, the launcher receives the `WorkerChannel`.
    pub fn pair(data: WorkerData) -> (Arc<Self>, TransportEvents, WorkerChannel) {
        let (to_child, from_parent) = mpsc::unbounded_channel();
        let (to_parent, mut from_child) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        let pump_tx = event_tx.clone();
        let pump_exited = Arc::clone(&exited);
        tokio::spawn(async move {
            while let Some(envelope) = from_child.recv().await {
                if pump_tx.send(TransportEvent::Message(envelope)).is_err() {
                    return;
                }
            }
            if !pump_exited.swap(true, Ordering::AcqRel) {
                let _ = pump_tx.send(TransportEvent::Exit { code: None });
            }
        });

        let transport = Arc::new(Self {
            to_child: parking_lot::Mutex::new(Some(to_child)),
            event_tx,
            exited,
        });
        let channel = WorkerChannel {
            data,
            to_parent,
            from_parent,
        };
        (transport, event_rx, channel)
    }
}

#[async_trait]
impl Transport for WorkerTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let guard = self.to_child.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(envelope.clone())
                .map_err(|_| ClusterError::Transport("worker channel closed".to_string())),
            None => Err(ClusterError::Transport("worker was killed".to_string())),
        }
    }

    async fn kill(&self) {
        // Closing the child-bound channel is the kill signal; the worker
        // observes it as Exit on its own event stream.
        self.to_child.lock().take();
        if !self.exited.swap(true, Ordering::AcqRel) {
            let _ = self.event_tx.send(TransportEvent::Exit { code: None });
        }
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WorkerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTransport")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Worker-side transport built from the launcher's `WorkerChannel`.
pub struct WorkerChildTransport {
    to_parent: mpsc::UnboundedSender<Envelope>,
}

impl WorkerChildTransport {
    /// Splits the channel into bootstrap data, a sending handle, and the
    /// inbound event stream.
    pub fn connect(channel: WorkerChannel) -> (WorkerData, Arc<Self>, TransportEvents) {
        let WorkerChannel {
            data,
            to_parent,
            mut from_parent,
        } = channel;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(envelope) = from_parent.recv().await {
                if event_tx.send(TransportEvent::Message(envelope)).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(TransportEvent::Exit { code: None });
        });

        (data, Arc::new(Self { to_parent }), event_rx)
    }
}

#[async_trait]
impl Transport for WorkerChildTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.to_parent
            .send(envelope.clone())
            .map_err(|_| ClusterError::Transport("manager channel closed".to_string()))
    }

    async fn kill(&self) {
        // Workers do not kill the manager; shutdown flows the other way.
    }

    fn is_alive(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for WorkerChildTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChildTransport").finish()
    }
}
