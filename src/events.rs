// # Observer Registry
//
// Explicit per-event-kind handler registries used by the manager, the
// manager-side clusters, and the child-side client in place of an ad-hoc
// event emitter. Event kinds are a closed enum; handlers are registered and
// deregistered by id, and the core never retains listeners it did not hand
// out an id for.

use crate::message::{ClusterId, IpcMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Closed set of observable lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Spawn,
    Ready,
    Disconnect,
    Reconnecting,
    Death,
    Error,
    Message,
    ClientRequest,
    ClusterDebug,
}

/// Data handed to event handlers.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Lifecycle transition of one cluster.
    Cluster { id: ClusterId },
    /// A recoverable error surfaced to observers.
    Error {
        cluster: Option<ClusterId>,
        message: String,
    },
    /// An uncategorized message or a custom request.
    Message {
        cluster: Option<ClusterId>,
        message: IpcMessage,
    },
    /// Supervisor decision trace.
    Debug {
        cluster: Option<ClusterId>,
        message: String,
    },
}

/// Opaque handle used to deregister a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Handler registry shared by one emitting entity.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one event kind and returns its id.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler; returns whether it was registered.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Invokes every handler registered for the kind. Handlers run outside
    /// the registry lock so they may register or deregister freely.
    pub fn emit(&self, kind: EventKind, payload: EventPayload) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.read();
            match handlers.get(&kind) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(&payload);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .get(&kind)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("kinds", &self.handlers.read().len())
            .finish()
    }
}
