// # Manager-Side Cluster
//
// One record per child execution unit: owns the live transport and its
// heartbeat monitor, runs the inbound dispatch table, and carries the
// spawn/kill/respawn lifecycle with its restart budget. Requests issued
// through a cluster are correlated in the manager's shared promise
// registry; in-flight eval and fetch requests are memoized by their exact
// script or property string.

use crate::error::{ClusterError, Result};
use crate::events::{EventBus, EventKind, EventPayload};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatState, RestartCounter};
use crate::manager::{BroadcastEvalOptions, ClusterEvalOptions, ClusterManager, FetchOptions};
use crate::message::{
    generate_nonce, now_millis, wire, ClusterId, Envelope, EnvelopeKind, ErrorPayload, IpcMessage,
    ShardId,
};
use crate::promise::{RegistryFailure, TimeoutKind, WaiterOptions};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default wait for the child's ready handshake.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default pause between a kill and the follow-up spawn.
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_millis(500);

/// Default deadline for correlated requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Outcome the ready handshake is waiting for.
#[derive(Debug, Clone, Copy)]
enum SpawnSignal {
    Ready,
    Disconnected,
    Died,
}

type InFlight = Shared<BoxFuture<'static, std::result::Result<Value, RegistryFailure>>>;

struct ClusterState {
    transport: Option<Arc<dyn Transport>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatMonitor>,
    ready: bool,
}

/// Manager-side record of one child execution unit.
pub struct Cluster {
    id: ClusterId,
    shard_list: Vec<ShardId>,
    total_shards: u32,
    env: HashMap<String, String>,
    manager: Weak<ClusterManager>,
    state: Mutex<ClusterState>,
    restarts: Mutex<RestartCounter>,
    respawning: AtomicBool,
    evals: Arc<DashMap<String, InFlight>>,
    fetches: Arc<DashMap<String, InFlight>>,
    spawn_waiters: Mutex<Vec<oneshot::Sender<SpawnSignal>>>,
    generation: AtomicU64,
    events: EventBus,
}

impl Cluster {
    pub(crate) fn new(
        id: ClusterId,
        shard_list: Vec<ShardId>,
        total_shards: u32,
        env: HashMap<String, String>,
        manager: Weak<ClusterManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            shard_list,
            total_shards,
            env,
            manager,
            state: Mutex::new(ClusterState {
                transport: None,
                reader_task: None,
                heartbeat: None,
                ready: false,
            }),
            restarts: Mutex::new(RestartCounter::new()),
            respawning: AtomicBool::new(false),
            evals: Arc::new(DashMap::new()),
            fetches: Arc::new(DashMap::new()),
            spawn_waiters: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            events: EventBus::new(),
        })
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn shard_list(&self) -> &[ShardId] {
        &self.shard_list
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    /// Immutable after spawn; merged into the child environment.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// True between a received `_ready` and the next disconnect or exit.
    pub fn ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().transport.is_some()
    }

    pub fn heartbeat_state(&self) -> Option<HeartbeatState> {
        self.state.lock().heartbeat.as_ref().map(|hb| hb.state())
    }

    /// Heartbeat-driven respawns consumed in the current budget window.
    pub fn restarts(&self) -> u32 {
        self.restarts.lock().current()
    }

    fn manager(&self) -> Result<Arc<ClusterManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| ClusterError::Internal("cluster manager dropped".to_string()))
    }

    fn debug_event(&self, message: String) {
        debug!(cluster = self.id, "{}", message);
        self.events.emit(
            EventKind::ClusterDebug,
            EventPayload::Debug {
                cluster: Some(self.id),
                message,
            },
        );
    }

    fn notify_spawn_waiters(&self, signal: SpawnSignal) {
        for waiter in self.spawn_waiters.lock().drain(..) {
            let _ = waiter.send(signal);
        }
    }

    /// Forks the child and, unless `spawn_timeout` is `None`, waits for
    /// the first of ready / disconnect / death / deadline.
    pub fn spawn(
        self: &Arc<Self>,
        spawn_timeout: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<()>> + Send + '_ {
        async move {
            let manager = self.manager()?;
            let mut waiter_rx = None;
            let generation = {
                let mut state = self.state.lock();
                if state.transport.is_some() {
                    return Err(ClusterError::ProcessExists(self.id));
                }
                let (transport, events) = manager.build_transport(self)?;
                self.evals.clear();
                self.fetches.clear();
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                state.transport = Some(transport);
                state.ready = false;
                // The waiter must exist before the reader runs, or a fast
                // child's ready signal slips past it.
                if spawn_timeout.is_some() {
                    let (tx, rx) = oneshot::channel();
                    self.spawn_waiters.lock().push(tx);
                    waiter_rx = Some(rx);
                }
                let cluster = Arc::clone(self);
                state.reader_task = Some(tokio::spawn(async move {
                    cluster.run_reader(events, generation).await;
                }));
                generation
            };

            info!(cluster = self.id, generation, "spawned cluster child");
            self.debug_event(format!("spawned child (generation {})", generation));
            self.events.emit(EventKind::Spawn, EventPayload::Cluster { id: self.id });

            let (Some(deadline), Some(rx)) = (spawn_timeout, waiter_rx) else {
                return Ok(());
            };
            match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(SpawnSignal::Ready)) => Ok(()),
                Ok(Ok(SpawnSignal::Disconnected)) => Err(ClusterError::ReadyDisconnected(self.id)),
                Ok(Ok(SpawnSignal::Died)) | Ok(Err(_)) => Err(ClusterError::ReadyDied(self.id)),
                Err(_) => Err(ClusterError::ReadyTimeout(self.id, deadline)),
            }
        }
    }

    /// Terminates the child. With `force` the heartbeat is cleared first
    /// so the watchdog cannot schedule a respawn while the transport goes
    /// down. The exit is claimed with respawning disabled before the
    /// transport is told to die, so the watchdog's own exit event finds
    /// nothing left to handle.
    pub async fn kill(self: &Arc<Self>, force: bool) {
        if force {
            let heartbeat = self.state.lock().heartbeat.take();
            if let Some(heartbeat) = heartbeat {
                heartbeat.cleanup();
            }
        }
        let transport = self.state.lock().transport.clone();
        let generation = self.generation.load(Ordering::Acquire);
        self.handle_exit(generation, None, false).await;
        if let Some(transport) = transport {
            transport.kill().await;
        }
    }

    /// `kill(force)`, a pause, then a fresh spawn.
    pub async fn respawn(self: &Arc<Self>, delay: Duration, timeout: Option<Duration>) -> Result<()> {
        self.kill(true).await;
        tokio::time::sleep(delay).await;
        self.spawn(timeout).await
    }

    /// Ships one envelope to the child.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let transport = self.state.lock().transport.clone();
        match transport {
            Some(transport) => transport.send(&envelope).await,
            None => Err(ClusterError::NoChildExists(self.id)),
        }
    }

    /// Evaluates a script on the child. Concurrent calls with the same
    /// script string collapse onto one in-flight request, so the timeout
    /// is first-caller-wins.
    pub async fn eval(
        self: &Arc<Self>,
        script: &str,
        context: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request = self.memoized(&self.evals, script, move |cluster, key| {
            async move {
                cluster
                    .correlated_request(
                        |nonce| Envelope::eval_request(nonce, &key, context),
                        timeout,
                        TimeoutKind::BroadcastEval,
                    )
                    .await
            }
            .boxed()
        });
        request.await.map_err(RegistryFailure::into_error)
    }

    /// Fetches a dotted-path value from the child's embedded client.
    /// Memoized by the exact property string, like `eval`.
    pub async fn fetch_client_value(
        self: &Arc<Self>,
        prop: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request = self.memoized(&self.fetches, prop, move |cluster, key| {
            async move {
                cluster
                    .correlated_request(
                        |nonce| Envelope::fetch_prop_request(nonce, &key),
                        timeout,
                        TimeoutKind::Eval,
                    )
                    .await
            }
            .boxed()
        });
        request.await.map_err(RegistryFailure::into_error)
    }

    /// Sends a custom request and always resolves with a value: any
    /// failure is folded into `{...message, error}` so fan-outs never
    /// short-circuit on a single cluster.
    pub async fn request(&self, message: Value, timeout: Option<Duration>) -> Value {
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(err) => return merge_error(message, err.to_string()),
        };
        let nonce = generate_nonce();
        let rx = manager.registry().register(
            &nonce,
            WaiterOptions {
                timeout: Some(timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)),
                timeout_kind: TimeoutKind::Eval,
                ..Default::default()
            },
        );
        if let Err(err) = self
            .send(Envelope::custom_request(&nonce, message.clone()))
            .await
        {
            manager
                .registry()
                .reject(&nonce, RegistryFailure::Channel(err.to_string()));
        }
        match rx.await {
            Ok(Ok(value)) => value,
            Ok(Err(failure)) => merge_error(message, failure.to_string()),
            Err(_) => merge_error(message, "waiter dropped without completion".to_string()),
        }
    }

    fn memoized<F>(
        self: &Arc<Self>,
        map: &Arc<DashMap<String, InFlight>>,
        key: &str,
        make: F,
    ) -> InFlight
    where
        F: FnOnce(Arc<Cluster>, String) -> BoxFuture<'static, std::result::Result<Value, RegistryFailure>>,
    {
        match map.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(slot) => {
                let map = Arc::clone(map);
                let key = key.to_string();
                let inner = make(Arc::clone(self), key.clone());
                let request: InFlight = async move {
                    let outcome = inner.await;
                    map.remove(&key);
                    outcome
                }
                .boxed()
                .shared();
                slot.insert(request.clone());
                request
            }
        }
    }

    async fn correlated_request<F>(
        self: &Arc<Self>,
        build: F,
        timeout: Option<Duration>,
        timeout_kind: TimeoutKind,
    ) -> std::result::Result<Value, RegistryFailure>
    where
        F: FnOnce(&str) -> Envelope,
    {
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(err) => return Err(RegistryFailure::Channel(err.to_string())),
        };
        let nonce = generate_nonce();
        let rx = manager.registry().register(
            &nonce,
            WaiterOptions {
                timeout,
                timeout_kind,
                ..Default::default()
            },
        );
        if let Err(err) = self.send(build(&nonce)).await {
            manager
                .registry()
                .reject(&nonce, RegistryFailure::Channel(err.to_string()));
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RegistryFailure::Channel(
                "waiter dropped without completion".to_string(),
            )),
        }
    }

    async fn run_reader(self: Arc<Self>, mut events: TransportEvents, generation: u64) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(envelope) => self.handle_message(envelope).await,
                TransportEvent::Error(message) => {
                    warn!(cluster = self.id, error = %message, "transport error");
                    self.events.emit(
                        EventKind::Error,
                        EventPayload::Error {
                            cluster: Some(self.id),
                            message,
                        },
                    );
                }
                TransportEvent::Exit { code } => {
                    self.handle_exit(generation, code, true).await;
                    break;
                }
            }
        }
    }

    /// Inbound dispatch. First match wins; asynchronous branches that may
    /// wait on other clusters run in their own tasks so this reader never
    /// blocks on its own reply stream.
    async fn handle_message(self: &Arc<Self>, envelope: Envelope) {
        match envelope.kind() {
            EnvelopeKind::Ready => self.on_ready(),
            EnvelopeKind::Disconnect => {
                self.state.lock().ready = false;
                self.notify_spawn_waiters(SpawnSignal::Disconnected);
                info!(cluster = self.id, "cluster disconnected");
                self.events
                    .emit(EventKind::Disconnect, EventPayload::Cluster { id: self.id });
            }
            EnvelopeKind::Reconnecting => {
                self.state.lock().ready = false;
                self.events
                    .emit(EventKind::Reconnecting, EventPayload::Cluster { id: self.id });
            }
            EnvelopeKind::KeepAlive => self.on_keep_alive().await,
            EnvelopeKind::BroadcastFetch => self.on_broadcast_fetch(envelope),
            EnvelopeKind::BroadcastEval => self.on_broadcast_eval(envelope),
            EnvelopeKind::ManagerEval => self.on_manager_eval(envelope),
            EnvelopeKind::ClusterEval => self.on_cluster_eval(envelope),
            EnvelopeKind::ClusterEvalResponse => self.on_cluster_eval_response(envelope).await,
            EnvelopeKind::RespawnAll => self.on_respawn_all(envelope),
            EnvelopeKind::SpawnNextCluster => {
                if let Ok(manager) = self.manager() {
                    if let Err(err) = manager.queue_next() {
                        debug!(cluster = self.id, error = %err, "spawn-next request rejected");
                    }
                }
            }
            EnvelopeKind::CustomReply => {
                if let (Ok(manager), Some(nonce)) = (self.manager(), envelope.nonce()) {
                    if !manager.registry().resolve(nonce, envelope.as_value()) {
                        debug!(cluster = self.id, nonce, "custom reply for unknown nonce");
                    }
                }
            }
            EnvelopeKind::CustomRequest => {
                self.events.emit(
                    EventKind::ClientRequest,
                    EventPayload::Message {
                        cluster: Some(self.id),
                        message: IpcMessage::new(envelope),
                    },
                );
            }
            EnvelopeKind::Reply | EnvelopeKind::ManagerEvalResponse => {
                if let (Ok(manager), Some(nonce)) = (self.manager(), envelope.nonce()) {
                    let outcome = match envelope.error_payload() {
                        Some(payload) => Err(payload),
                        None => Ok(envelope.result_value().cloned().unwrap_or(Value::Null)),
                    };
                    manager.registry().insert_result(nonce, outcome);
                }
            }
            _ => {
                self.events.emit(
                    EventKind::Message,
                    EventPayload::Message {
                        cluster: Some(self.id),
                        message: IpcMessage::new(envelope),
                    },
                );
            }
        }
    }

    fn on_ready(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.ready = true;
            if state.heartbeat.is_none() {
                if let Ok(manager) = self.manager() {
                    if let Some(config) = manager.keep_alive() {
                        if config.enabled() {
                            let weak = Arc::downgrade(self);
                            state.heartbeat = Some(HeartbeatMonitor::start(&config, move |missed| {
                                if let Some(cluster) = weak.upgrade() {
                                    tokio::spawn(async move {
                                        cluster.heartbeat_respawn(missed).await;
                                    });
                                }
                            }));
                        }
                    }
                }
            }
        }
        self.notify_spawn_waiters(SpawnSignal::Ready);
        info!(cluster = self.id, "cluster ready");
        self.events
            .emit(EventKind::Ready, EventPayload::Cluster { id: self.id });
    }

    async fn on_keep_alive(self: &Arc<Self>) {
        if let Some(heartbeat) = self.state.lock().heartbeat.as_ref() {
            heartbeat.beat();
        }
        if let Err(err) = self.send(Envelope::ack(now_millis())).await {
            let err = ClusterError::AckDeliveryFailed(self.id, err.to_string());
            warn!(cluster = self.id, error = %err, "heartbeat ack not delivered");
            self.events.emit(
                EventKind::Error,
                EventPayload::Error {
                    cluster: Some(self.id),
                    message: err.to_string(),
                },
            );
        }
    }

    fn on_broadcast_fetch(self: &Arc<Self>, envelope: Envelope) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let prop = envelope
                .str_field(wire::S_FETCH_PROP)
                .unwrap_or_default()
                .to_string();
            let options = FetchOptions {
                shard: envelope
                    .u64_field(wire::S_FETCH_PROP_SHARD)
                    .map(|shard| shard as ShardId),
                ..Default::default()
            };
            let Ok(manager) = cluster.manager() else {
                return;
            };
            let reply = match manager.fetch_client_values(&prop, options).await {
                Ok(value) => Envelope::result_reply(&nonce, value),
                Err(err) => Envelope::error_reply(&nonce, &ErrorPayload::from_cluster_error(&err)),
            };
            if let Err(err) = cluster.send(reply).await {
                debug!(cluster = cluster.id, error = %err, "fetch fan-out reply lost");
            }
        });
    }

    fn on_broadcast_eval(self: &Arc<Self>, envelope: Envelope) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let script = envelope
                .str_field(wire::S_EVAL)
                .unwrap_or_default()
                .to_string();
            let options = BroadcastEvalOptions {
                shard: envelope
                    .u64_field(wire::S_EVAL_SHARD)
                    .map(|shard| shard as ShardId),
                timeout: envelope
                    .u64_field(wire::S_EVAL_TIMEOUT)
                    .map(Duration::from_millis),
                context: envelope.get(wire::EVAL_CONTEXT).cloned(),
                ..Default::default()
            };
            let Ok(manager) = cluster.manager() else {
                return;
            };
            let reply = match manager.broadcast_eval(&script, options).await {
                Ok(value) => Envelope::result_reply(&nonce, value),
                Err(err) => Envelope::error_reply(&nonce, &ErrorPayload::from_cluster_error(&err)),
            };
            if let Err(err) = cluster.send(reply).await {
                debug!(cluster = cluster.id, error = %err, "eval fan-out reply lost");
            }
        });
    }

    fn on_manager_eval(self: &Arc<Self>, envelope: Envelope) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let script = envelope
                .str_field(wire::S_MANAGER_EVAL)
                .unwrap_or_default()
                .to_string();
            let context = envelope.get(wire::EVAL_CONTEXT).cloned();
            let Ok(manager) = cluster.manager() else {
                return;
            };
            let reply = match manager.eval_on_manager(&script, context).await {
                Ok(value) => Envelope::manager_eval_response(&nonce, Ok(value)),
                Err(err) => Envelope::manager_eval_response(
                    &nonce,
                    Err(&ErrorPayload::from_cluster_error(&err)),
                ),
            };
            if let Err(err) = cluster.send(reply).await {
                debug!(cluster = cluster.id, error = %err, "manager eval reply lost");
            }
        });
    }

    fn on_cluster_eval(self: &Arc<Self>, envelope: Envelope) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let script = envelope
                .str_field(wire::S_CLUSTER_EVAL)
                .unwrap_or_default()
                .to_string();
            let options = ClusterEvalOptions {
                cluster: envelope.u64_field(wire::CLUSTER).map(|id| id as ClusterId),
                shard: envelope.u64_field(wire::SHARD).map(|shard| shard as ShardId),
                guild_id: envelope.u64_field(wire::GUILD_ID),
                timeout: envelope
                    .u64_field(wire::TIMEOUT)
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                context: envelope.get(wire::EVAL_CONTEXT).cloned(),
                request_cluster: Some(cluster.id),
                nonce: Some(nonce.clone()),
            };
            let Ok(manager) = cluster.manager() else {
                return;
            };
            // On success the response branch has already routed the reply
            // back to this cluster; failures are reported under the same
            // nonce so the origin's waiter is not left to time out.
            if let Err(err) = manager.eval_on_cluster(&script, options).await {
                let reply = Envelope::cluster_eval_response(
                    &nonce,
                    Err(&ErrorPayload::from_cluster_error(&err)),
                );
                if let Err(err) = cluster.send(reply).await {
                    debug!(cluster = cluster.id, error = %err, "cluster eval error reply lost");
                }
            }
        });
    }

    async fn on_cluster_eval_response(self: &Arc<Self>, envelope: Envelope) {
        let Ok(manager) = self.manager() else {
            return;
        };
        let Some(nonce) = envelope.nonce().map(str::to_string) else {
            return;
        };
        // The routing tag must be read before the waiter is consumed.
        let origin = manager.registry().request_cluster(&nonce);
        match envelope.error_payload() {
            Some(payload) => {
                manager
                    .registry()
                    .reject(&nonce, RegistryFailure::Remote(payload));
            }
            None => {
                manager.registry().resolve(
                    &nonce,
                    envelope.result_value().cloned().unwrap_or(Value::Null),
                );
            }
        }
        if let Some(origin) = origin {
            match manager.cluster(origin) {
                Some(origin_cluster) => {
                    if let Err(err) = origin_cluster.send(envelope).await {
                        debug!(
                            cluster = self.id,
                            origin, error = %err,
                            "cross-cluster reply could not be forwarded"
                        );
                    }
                }
                None => debug!(origin, "request cluster vanished before reply"),
            }
        }
    }

    fn on_respawn_all(self: &Arc<Self>, envelope: Envelope) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(manager) = cluster.manager() else {
                return;
            };
            let options = crate::manager::RespawnOptions {
                cluster_delay: envelope
                    .u64_field(wire::CLUSTER_DELAY)
                    .map(Duration::from_millis)
                    .unwrap_or(crate::manager::DEFAULT_CLUSTER_DELAY),
                respawn_delay: envelope
                    .u64_field(wire::RESPAWN_DELAY)
                    .map(Duration::from_millis)
                    .unwrap_or(crate::manager::DEFAULT_RESPAWN_ALL_DELAY),
                timeout: envelope
                    .u64_field(wire::TIMEOUT)
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_SPAWN_TIMEOUT),
            };
            // Errors are deliberately ignored on this path.
            if let Err(err) = manager.respawn_all(options).await {
                debug!(error = %err, "respawn-all request failed");
            }
        });
    }

    async fn heartbeat_respawn(self: Arc<Self>, missed: u32) {
        let Ok(manager) = self.manager() else {
            return;
        };
        let Some(config) = manager.keep_alive() else {
            return;
        };
        if self.respawning.swap(true, Ordering::AcqRel) {
            return;
        }
        let allowed = self
            .restarts
            .lock()
            .try_consume(config.max_cluster_restarts);
        if !allowed {
            warn!(
                cluster = self.id,
                missed, "restart budget exhausted; heartbeat respawns suspended until window rollover"
            );
            self.debug_event("restart budget exhausted; respawn suppressed".to_string());
            self.respawning.store(false, Ordering::Release);
            return;
        }
        warn!(cluster = self.id, missed, "cluster unhealthy, respawning");
        self.debug_event(format!("heartbeat respawn after {} missed beats", missed));
        if let Err(err) = self
            .respawn(DEFAULT_RESPAWN_DELAY, Some(DEFAULT_SPAWN_TIMEOUT))
            .await
        {
            error!(cluster = self.id, error = %err, "heartbeat respawn failed");
            self.events.emit(
                EventKind::Error,
                EventPayload::Error {
                    cluster: Some(self.id),
                    message: err.to_string(),
                },
            );
        }
        self.respawning.store(false, Ordering::Release);
    }

    /// Tears down after the transport is gone. Stale generations are
    /// ignored so an old watchdog cannot take down a fresh child; the
    /// second invocation for the same generation is a no-op.
    fn handle_exit(
        self: &Arc<Self>,
        generation: u64,
        code: Option<i32>,
        respawn_allowed: bool,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let heartbeat = {
                let mut state = self.state.lock();
                if state.transport.is_none() {
                    return;
                }
                state.transport = None;
                state.reader_task = None;
                state.ready = false;
                state.heartbeat.take()
            };
            if let Some(heartbeat) = heartbeat {
                heartbeat.cleanup();
            }
            self.notify_spawn_waiters(SpawnSignal::Died);
            info!(cluster = self.id, code = ?code, "cluster child exited");
            self.debug_event(format!("child exited with code {:?}", code));
            self.events
                .emit(EventKind::Death, EventPayload::Cluster { id: self.id });

            if respawn_allowed {
                if let Ok(manager) = self.manager() {
                    if manager.respawn_enabled() {
                        let cluster = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(err) = cluster
                                .respawn(DEFAULT_RESPAWN_DELAY, Some(DEFAULT_SPAWN_TIMEOUT))
                                .await
                            {
                                error!(cluster = cluster.id, error = %err, "auto-respawn failed");
                                cluster.events.emit(
                                    EventKind::Error,
                                    EventPayload::Error {
                                        cluster: Some(cluster.id),
                                        message: err.to_string(),
                                    },
                                );
                            }
                        });
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("shards", &self.shard_list.len())
            .field("running", &self.is_running())
            .field("ready", &self.ready())
            .finish()
    }
}

/// Folds a request failure into the resolved value: `{...message, error}`.
fn merge_error(message: Value, error: String) -> Value {
    match message {
        Value::Object(mut map) => {
            map.insert("error".to_string(), Value::String(error));
            Value::Object(map)
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert("message".to_string(), other);
            map.insert("error".to_string(), Value::String(error));
            Value::Object(map)
        }
    }
}
