// # Cluster Client
//
// Child-side mirror of the manager-side cluster record. Bootstraps from
// the process environment (process mode) or the structured worker block
// (worker mode), answers fetch/eval requests through the embedded
// `ScriptHost`, relays heartbeats, and re-exports the request surface so
// application code inside a cluster can reach its siblings and the
// manager.

use crate::cluster::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{ClusterError, Result};
use crate::events::{EventBus, EventKind, EventPayload};
use crate::heartbeat::{HeartbeatProducer, HeartbeatState, KeepAliveConfig};
use crate::manager::{env, ClusterEvalOptions, ClusterMode, RespawnOptions};
use crate::message::{
    generate_nonce, wire, ClusterId, Envelope, EnvelopeKind, IpcMessage, ShardId,
};
use crate::promise::{self, PromiseRegistry, RegistryFailure, TimeoutKind, WaiterOptions};
use crate::queue::QueueMode;
use crate::script::ScriptHost;
use crate::transport::{
    StdioTransport, Transport, TransportEvent, TransportEvents, WorkerChannel, WorkerChildTransport,
    WorkerData,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bootstrap facts handed to a child at spawn time.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub id: ClusterId,
    /// Shards owned by this cluster. Never empty.
    pub shard_list: Vec<ShardId>,
    pub total_shards: u32,
    pub cluster_count: u32,
    pub mode: ClusterMode,
    /// Zero when the heartbeat is disabled.
    pub keep_alive_interval: Duration,
    pub queue_mode: QueueMode,
}

impl ClusterInfo {
    /// Reads the process-mode environment block. A missing or invalid
    /// `CLUSTER_MANAGER_MODE` means this process was not launched by a
    /// manager and fails fast.
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var(env::CLUSTER_MANAGER_MODE)
            .ok()
            .and_then(|raw| ClusterMode::from_str(&raw).ok())
            .ok_or(ClusterError::NoChildOrMasterOrBadMode)?;

        let shard_list = parse_shard_list(&required_var(env::SHARD_LIST)?)?;
        Ok(Self {
            id: parse_var(env::CLUSTER)?,
            shard_list,
            total_shards: parse_var(env::TOTAL_SHARDS)?,
            cluster_count: parse_var(env::CLUSTER_COUNT)?,
            mode,
            keep_alive_interval: Duration::from_millis(parse_var(env::KEEP_ALIVE_INTERVAL)?),
            queue_mode: required_var(env::CLUSTER_QUEUE_MODE)?.parse()?,
        })
    }

    /// Builds the same facts from a worker bootstrap block.
    pub fn from_worker_data(data: &WorkerData) -> Self {
        Self {
            id: data.cluster_id,
            shard_list: data.shard_list.clone(),
            total_shards: data.total_shards,
            cluster_count: data.cluster_count,
            mode: ClusterMode::Worker,
            keep_alive_interval: Duration::from_millis(data.keep_alive_interval_ms),
            queue_mode: data.queue_mode,
        }
    }

    pub fn first_shard_id(&self) -> ShardId {
        self.shard_list.first().copied().unwrap_or(0)
    }

    pub fn last_shard_id(&self) -> ShardId {
        self.shard_list.last().copied().unwrap_or(0)
    }
}

fn required_var(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| ClusterError::InvalidConfig(format!("missing environment variable {}", key)))
}

fn parse_var<T: FromStr>(key: &str) -> Result<T> {
    required_var(key)?
        .parse()
        .map_err(|_| ClusterError::InvalidConfig(format!("invalid value for {}", key)))
}

fn parse_shard_list(raw: &str) -> Result<Vec<ShardId>> {
    let shards = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<ShardId>()
                .map_err(|_| ClusterError::InvalidConfig(format!("invalid shard id: {}", part)))
        })
        .collect::<Result<Vec<_>>>()?;
    if shards.is_empty() {
        return Err(ClusterError::InvalidConfig(
            "shard list must not be empty".to_string(),
        ));
    }
    Ok(shards)
}

/// Child-side facade over the IPC fabric.
pub struct ClusterClient {
    info: ClusterInfo,
    env: HashMap<String, String>,
    transport: Arc<dyn Transport>,
    registry: PromiseRegistry,
    script_host: Arc<dyn ScriptHost>,
    events: EventBus,
    heartbeat: Mutex<Option<HeartbeatProducer>>,
    ready: AtomicBool,
}

impl ClusterClient {
    /// Process-mode construction: bootstrap from the environment and
    /// attach to the stdio pipes.
    pub fn from_env(script_host: Arc<dyn ScriptHost>) -> Result<Arc<Self>> {
        let info = ClusterInfo::from_env()?;
        let (transport, events) = StdioTransport::connect();
        Ok(Self::attach(info, HashMap::new(), transport, events, script_host))
    }

    /// Worker-mode construction from the launcher's channel.
    pub fn from_worker(channel: WorkerChannel, script_host: Arc<dyn ScriptHost>) -> Arc<Self> {
        let (data, transport, events) = WorkerChildTransport::connect(channel);
        let info = ClusterInfo::from_worker_data(&data);
        Self::attach(info, data.env, transport, events, script_host)
    }

    fn attach(
        info: ClusterInfo,
        env: HashMap<String, String>,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        script_host: Arc<dyn ScriptHost>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            info,
            env,
            transport,
            registry: PromiseRegistry::new(),
            script_host,
            events: EventBus::new(),
            heartbeat: Mutex::new(None),
            ready: AtomicBool::new(false),
        });
        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            reader.run_reader(events).await;
        });
        client
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn id(&self) -> ClusterId {
        self.info.id
    }

    /// Shard ids owned by this cluster.
    pub fn ids(&self) -> &[ShardId] {
        &self.info.shard_list
    }

    pub fn count(&self) -> u32 {
        self.info.cluster_count
    }

    pub fn mode(&self) -> ClusterMode {
        self.info.mode
    }

    /// Application-defined bootstrap variables (worker mode).
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn heartbeat_state(&self) -> Option<HeartbeatState> {
        self.heartbeat.lock().as_ref().map(|hb| hb.state())
    }

    /// Forwards the embedded application's ready signal and starts the
    /// heartbeat producer. The ready envelope goes first so the manager's
    /// consumer is armed before the first beat arrives.
    pub async fn notify_ready(&self) -> Result<()> {
        self.ready.store(true, Ordering::Release);
        self.send(Envelope::ready()).await?;
        self.start_heartbeat();
        Ok(())
    }

    pub async fn notify_disconnect(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        self.send(Envelope::disconnect()).await
    }

    pub async fn notify_reconnecting(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        self.send(Envelope::reconnecting()).await
    }

    /// Ships one envelope to the manager.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.transport.send(&envelope).await
    }

    /// Custom request to the manager. Mirrors the manager-side contract:
    /// failures are folded into the resolved `{...message, error}` value.
    pub async fn request(&self, message: Value, timeout: Option<Duration>) -> Value {
        let nonce = generate_nonce();
        let rx = self.registry.register(
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
            self.registry
                .reject(&nonce, RegistryFailure::Channel(err.to_string()));
        }
        match rx.await {
            Ok(Ok(value)) => value,
            Ok(Err(failure)) => merge_request_error(message, failure.to_string()),
            Err(_) => merge_request_error(message, "waiter dropped without completion".to_string()),
        }
    }

    /// Asks the manager to evaluate a script on every cluster (or the one
    /// owning `shard`) and aggregate the results.
    pub async fn broadcast_eval(&self, script: &str, options: ClientEvalOptions) -> Result<Value> {
        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        self.correlated(
            TimeoutKind::BroadcastEval,
            timeout,
            |nonce| {
                Envelope::broadcast_eval_request(
                    nonce,
                    script,
                    options.shard,
                    Some(timeout.as_millis() as u64),
                    options.context.clone(),
                )
            },
        )
        .await
    }

    /// Asks the manager for a dotted-path value from every cluster (or
    /// the one owning `shard`).
    pub async fn fetch_client_values(
        &self,
        prop: &str,
        shard: Option<ShardId>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        self.correlated(TimeoutKind::Eval, timeout, |nonce| {
            Envelope::broadcast_fetch_request(nonce, prop, shard)
        })
        .await
    }

    /// Evaluates in the manager's sandbox.
    pub async fn eval_on_manager(
        &self,
        script: &str,
        context: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        self.correlated(TimeoutKind::Eval, timeout, |nonce| {
            Envelope::manager_eval_request(nonce, script, context.clone())
        })
        .await
    }

    /// Evaluates on a sibling cluster, routed by the manager.
    pub async fn eval_on_cluster(&self, script: &str, options: ClusterEvalOptions) -> Result<Value> {
        let timeout = options.timeout;
        self.correlated(TimeoutKind::Eval, timeout, |nonce| {
            Envelope::cluster_eval(
                nonce,
                script,
                options.cluster,
                options.shard,
                options.guild_id,
                Some(timeout.as_millis() as u64),
                options.context.clone(),
            )
        })
        .await
    }

    /// Fire-and-forget rolling respawn of the whole cluster set.
    pub async fn respawn_all(&self, options: RespawnOptions) -> Result<()> {
        self.send(Envelope::respawn_all(
            options.cluster_delay.as_millis() as u64,
            options.respawn_delay.as_millis() as u64,
            options.timeout.as_millis() as u64,
        ))
        .await
    }

    /// Advances a manual spawn queue. Raises `SpawnQueueAuto` locally when
    /// the queue is automatic.
    pub async fn spawn_next_cluster(&self) -> Result<()> {
        if self.info.queue_mode == QueueMode::Auto {
            return Err(ClusterError::SpawnQueueAuto);
        }
        self.send(Envelope::spawn_next_cluster()).await
    }

    async fn correlated<F>(
        &self,
        timeout_kind: TimeoutKind,
        timeout: Duration,
        build: F,
    ) -> Result<Value>
    where
        F: FnOnce(&str) -> Envelope,
    {
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            WaiterOptions {
                timeout: Some(timeout),
                timeout_kind,
                ..Default::default()
            },
        );
        if let Err(err) = self.send(build(&nonce)).await {
            self.registry
                .reject(&nonce, RegistryFailure::Channel(err.to_string()));
        }
        promise::wait(rx).await
    }

    fn start_heartbeat(&self) {
        if self.info.keep_alive_interval.is_zero() {
            return;
        }
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_none() {
            let config = KeepAliveConfig {
                interval: self.info.keep_alive_interval,
                ..Default::default()
            };
            *heartbeat = Some(HeartbeatProducer::start(&config, Arc::clone(&self.transport)));
        }
    }

    async fn run_reader(self: Arc<Self>, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(envelope) => self.handle_message(envelope).await,
                TransportEvent::Error(message) => {
                    warn!(cluster = self.id(), error = %message, "transport error");
                    self.events.emit(
                        EventKind::Error,
                        EventPayload::Error {
                            cluster: Some(self.id()),
                            message,
                        },
                    );
                }
                TransportEvent::Exit { .. } => {
                    self.on_manager_gone();
                    break;
                }
            }
        }
    }

    fn on_manager_gone(&self) {
        warn!(cluster = self.id(), "manager channel closed");
        self.ready.store(false, Ordering::Release);
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.cleanup();
        }
        self.events
            .emit(EventKind::Death, EventPayload::Cluster { id: self.id() });
    }

    /// Inbound dispatch, symmetric to the manager-side table. Evaluations
    /// run in their own tasks so control traffic is never blocked behind a
    /// slow script.
    async fn handle_message(self: &Arc<Self>, envelope: Envelope) {
        match envelope.kind() {
            EnvelopeKind::FetchProp => self.on_fetch_prop(envelope),
            EnvelopeKind::Eval => self.on_eval(envelope),
            EnvelopeKind::ClusterEvalRequest => self.on_cluster_eval_request(envelope),
            EnvelopeKind::ClusterEvalResponse
            | EnvelopeKind::ManagerEvalResponse
            | EnvelopeKind::Reply => {
                if let Some(nonce) = envelope.nonce() {
                    let outcome = match envelope.error_payload() {
                        Some(payload) => Err(payload),
                        None => Ok(envelope.result_value().cloned().unwrap_or(Value::Null)),
                    };
                    if !self.registry.insert_result(nonce, outcome) {
                        debug!(cluster = self.id(), nonce, "reply for unknown nonce");
                    }
                }
            }
            EnvelopeKind::Ack => {
                if let Some(heartbeat) = self.heartbeat.lock().as_ref() {
                    heartbeat.ack();
                }
            }
            EnvelopeKind::CustomReply => {
                if let Some(nonce) = envelope.nonce() {
                    if !self.registry.resolve(nonce, envelope.as_value()) {
                        debug!(cluster = self.id(), nonce, "custom reply for unknown nonce");
                    }
                }
            }
            EnvelopeKind::CustomRequest => {
                self.events.emit(
                    EventKind::ClientRequest,
                    EventPayload::Message {
                        cluster: Some(self.id()),
                        message: IpcMessage::new(envelope),
                    },
                );
            }
            _ => {
                self.events.emit(
                    EventKind::Message,
                    EventPayload::Message {
                        cluster: Some(self.id()),
                        message: IpcMessage::new(envelope),
                    },
                );
            }
        }
    }

    fn on_fetch_prop(self: &Arc<Self>, envelope: Envelope) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let prop = envelope
                .str_field(wire::FETCH_PROP)
                .unwrap_or_default()
                .to_string();
            let value = client.script_host.fetch_prop(&prop).await;
            if let Err(err) = client.send(Envelope::result_reply(&nonce, value)).await {
                debug!(cluster = client.id(), error = %err, "fetch reply lost");
            }
        });
    }

    fn on_eval(self: &Arc<Self>, envelope: Envelope) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let script = envelope
                .str_field(wire::EVAL)
                .unwrap_or_default()
                .to_string();
            let context = envelope.get(wire::EVAL_CONTEXT).cloned();
            let reply = match client.script_host.eval(&script, context).await {
                Ok(value) => Envelope::result_reply(&nonce, value),
                Err(payload) => Envelope::error_reply(&nonce, &payload),
            };
            if let Err(err) = client.send(reply).await {
                debug!(cluster = client.id(), error = %err, "eval reply lost");
            }
        });
    }

    fn on_cluster_eval_request(self: &Arc<Self>, envelope: Envelope) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let Some(nonce) = envelope.nonce().map(str::to_string) else {
                return;
            };
            let script = envelope
                .str_field(wire::S_CLUSTER_EVAL_REQUEST)
                .unwrap_or_default()
                .to_string();
            let context = envelope.get(wire::EVAL_CONTEXT).cloned();
            let reply = match client.script_host.eval(&script, context).await {
                Ok(value) => Envelope::cluster_eval_response(&nonce, Ok(value)),
                Err(payload) => Envelope::cluster_eval_response(&nonce, Err(&payload)),
            };
            if let Err(err) = client.send(reply).await {
                debug!(cluster = client.id(), error = %err, "cross-cluster reply lost");
            }
        });
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("id", &self.info.id)
            .field("shards", &self.info.shard_list.len())
            .field("ready", &self.ready())
            .finish()
    }
}

/// Targeting for child-initiated broadcast evals.
#[derive(Debug, Clone, Default)]
pub struct ClientEvalOptions {
    pub shard: Option<ShardId>,
    pub timeout: Option<Duration>,
    pub context: Option<Value>,
}

fn merge_request_error(message: Value, error: String) -> Value {
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
