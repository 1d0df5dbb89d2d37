// # Cluster Manager
//
// Owns the cluster set. Partitions shards into contiguous slices, spawns
// each cluster through the spawn queue, and mediates every cross-cluster
// operation: broadcast and targeted eval/fetch fan-out, manager-local
// evaluation, cross-cluster eval routing with origin tagging, and rolling
// respawns.

use crate::cluster::{Cluster, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SPAWN_TIMEOUT};
use crate::error::{ClusterError, Result};
use crate::events::EventBus;
use crate::heartbeat::KeepAliveConfig;
use crate::message::{generate_nonce, ClusterId, Envelope, ShardId};
use crate::promise::{self, PromiseRegistry, RegistryFailure, TimeoutKind, WaiterOptions};
use crate::queue::{QueueMode, SpawnQueue};
use crate::script::{CommandScriptHost, ScriptHost};
use crate::transport::{
    ProcessTransport, SpawnOptions, Transport, TransportEvents, WorkerData, WorkerLauncher,
    WorkerTransport,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Pause between rolling respawns of consecutive clusters.
pub const DEFAULT_CLUSTER_DELAY: Duration = Duration::from_millis(5000);

/// Kill-to-spawn pause used by `respawn_all`.
pub const DEFAULT_RESPAWN_ALL_DELAY: Duration = Duration::from_millis(7000);

/// Default pause between queued spawns in auto mode.
pub const DEFAULT_SPAWN_DELAY: Duration = Duration::from_millis(5000);

/// Environment keys of the process-mode bootstrap block.
pub mod env {
    pub const CLUSTER_MANAGER_MODE: &str = "CLUSTER_MANAGER_MODE";
    pub const CLUSTER: &str = "CLUSTER";
    pub const CLUSTER_COUNT: &str = "CLUSTER_COUNT";
    pub const SHARD_LIST: &str = "SHARD_LIST";
    pub const TOTAL_SHARDS: &str = "TOTAL_SHARDS";
    pub const KEEP_ALIVE_INTERVAL: &str = "KEEP_ALIVE_INTERVAL";
    pub const CLUSTER_QUEUE_MODE: &str = "CLUSTER_QUEUE_MODE";
    pub const TOKEN: &str = "TOKEN";
}

/// Child execution flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Process,
    Worker,
}

impl ClusterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterMode::Process => "process",
            ClusterMode::Worker => "worker",
        }
    }
}

impl FromStr for ClusterMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(ClusterMode::Process),
            "worker" => Ok(ClusterMode::Worker),
            other => Err(ClusterError::InvalidConfig(format!(
                "unknown cluster mode: {}",
                other
            ))),
        }
    }
}

/// Construction-time configuration.
pub struct ClusterManagerOptions {
    pub mode: ClusterMode,
    /// Program forked per cluster in process mode.
    pub file: PathBuf,
    pub total_shards: u32,
    /// Defaults to the machine's logical core count, capped by the shard
    /// count.
    pub total_clusters: Option<u32>,
    /// Explicit shard list to partition; defaults to `0..total_shards`.
    pub shard_list: Option<Vec<ShardId>>,
    /// `None` disables the heartbeat.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Auto-respawn clusters whose child exits.
    pub respawn: bool,
    pub queue_mode: QueueMode,
    pub spawn_delay: Duration,
    pub spawn_timeout: Duration,
    /// Upstream credential forwarded to children as `TOKEN`.
    pub token: Option<String>,
    /// Environment shared by every child.
    pub env: HashMap<String, String>,
    /// Process-mode spawn knobs.
    pub spawn_options: SpawnOptions,
    /// Required in worker mode.
    pub worker_launcher: Option<Arc<dyn WorkerLauncher>>,
    /// Sandbox behind `eval_on_manager`; a whitelist host by default.
    pub script_host: Option<Arc<dyn ScriptHost>>,
}

impl Default for ClusterManagerOptions {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Process,
            file: PathBuf::new(),
            total_shards: 1,
            total_clusters: None,
            shard_list: None,
            keep_alive: Some(KeepAliveConfig::default()),
            respawn: true,
            queue_mode: QueueMode::Auto,
            spawn_delay: DEFAULT_SPAWN_DELAY,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            token: None,
            env: HashMap::new(),
            spawn_options: SpawnOptions::default(),
            worker_launcher: None,
            script_host: None,
        }
    }
}

impl std::fmt::Debug for ClusterManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManagerOptions")
            .field("mode", &self.mode)
            .field("file", &self.file)
            .field("total_shards", &self.total_shards)
            .field("total_clusters", &self.total_clusters)
            .field("respawn", &self.respawn)
            .field("queue_mode", &self.queue_mode)
            .finish_non_exhaustive()
    }
}

/// Targeting for `broadcast_eval`.
#[derive(Debug, Clone, Default)]
pub struct BroadcastEvalOptions {
    pub cluster: Option<ClusterId>,
    pub shard: Option<ShardId>,
    pub timeout: Option<Duration>,
    pub context: Option<Value>,
}

/// Targeting for `fetch_client_values`.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub cluster: Option<ClusterId>,
    pub shard: Option<ShardId>,
    pub timeout: Option<Duration>,
}

/// Targeting and correlation for `eval_on_cluster`.
#[derive(Debug, Clone)]
pub struct ClusterEvalOptions {
    pub cluster: Option<ClusterId>,
    pub shard: Option<ShardId>,
    pub guild_id: Option<u64>,
    pub timeout: Duration,
    pub context: Option<Value>,
    /// Origin cluster; the reply envelope is routed back to it.
    pub request_cluster: Option<ClusterId>,
    /// Preserved nonce when the request was forwarded from a child.
    pub nonce: Option<String>,
}

impl Default for ClusterEvalOptions {
    fn default() -> Self {
        Self {
            cluster: None,
            shard: None,
            guild_id: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            context: None,
            request_cluster: None,
            nonce: None,
        }
    }
}

/// Pacing for `respawn_all`.
#[derive(Debug, Clone)]
pub struct RespawnOptions {
    pub cluster_delay: Duration,
    pub respawn_delay: Duration,
    pub timeout: Duration,
}

impl Default for RespawnOptions {
    fn default() -> Self {
        Self {
            cluster_delay: DEFAULT_CLUSTER_DELAY,
            respawn_delay: DEFAULT_RESPAWN_ALL_DELAY,
            timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }
}

/// Splits a shard list into contiguous per-cluster slices whose sizes
/// differ by at most one.
pub fn partition_shards(shards: &[ShardId], clusters: usize) -> Vec<Vec<ShardId>> {
    let base = shards.len() / clusters;
    let extra = shards.len() % clusters;
    let mut partitions = Vec::with_capacity(clusters);
    let mut offset = 0;
    for index in 0..clusters {
        let take = base + usize::from(index < extra);
        partitions.push(shards[offset..offset + take].to_vec());
        offset += take;
    }
    partitions
}

/// Supervisor for a horizontally partitioned client application.
pub struct ClusterManager {
    mode: ClusterMode,
    file: PathBuf,
    total_shards: u32,
    total_clusters: u32,
    shard_list: Vec<ShardId>,
    keep_alive: Option<KeepAliveConfig>,
    respawn: bool,
    token: Option<String>,
    base_env: HashMap<String, String>,
    spawn_options: SpawnOptions,
    spawn_timeout: Duration,
    worker_launcher: Option<Arc<dyn WorkerLauncher>>,
    script_host: Arc<dyn ScriptHost>,
    clusters: RwLock<BTreeMap<ClusterId, Arc<Cluster>>>,
    registry: PromiseRegistry,
    queue: SpawnQueue,
    events: EventBus,
}

impl ClusterManager {
    pub fn new(options: ClusterManagerOptions) -> Result<Arc<Self>> {
        let shard_list = options
            .shard_list
            .unwrap_or_else(|| (0..options.total_shards).collect());
        if shard_list.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "shard list must not be empty".to_string(),
            ));
        }
        let total_clusters = options
            .total_clusters
            .unwrap_or_else(|| num_cpus::get() as u32)
            .min(shard_list.len() as u32);
        if total_clusters == 0 {
            return Err(ClusterError::InvalidConfig(
                "at least one cluster is required".to_string(),
            ));
        }
        match options.mode {
            ClusterMode::Process => {
                if options.file.as_os_str().is_empty() {
                    return Err(ClusterError::InvalidConfig(
                        "process mode requires a child program path".to_string(),
                    ));
                }
            }
            ClusterMode::Worker => {
                if options.worker_launcher.is_none() {
                    return Err(ClusterError::InvalidConfig(
                        "worker mode requires a worker launcher".to_string(),
                    ));
                }
            }
        }

        Ok(Arc::new(Self {
            mode: options.mode,
            file: options.file,
            total_shards: options.total_shards,
            total_clusters,
            shard_list,
            keep_alive: options.keep_alive.filter(KeepAliveConfig::enabled),
            respawn: options.respawn,
            token: options.token,
            base_env: options.env,
            spawn_options: options.spawn_options,
            spawn_timeout: options.spawn_timeout,
            worker_launcher: options.worker_launcher,
            script_host: options
                .script_host
                .unwrap_or_else(|| Arc::new(CommandScriptHost::new())),
            clusters: RwLock::new(BTreeMap::new()),
            registry: PromiseRegistry::new(),
            queue: SpawnQueue::new(options.queue_mode, options.spawn_delay),
            events: EventBus::new(),
        }))
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    pub fn shard_list(&self) -> &[ShardId] {
        &self.shard_list
    }

    pub fn keep_alive(&self) -> Option<KeepAliveConfig> {
        self.keep_alive.clone()
    }

    pub fn respawn_enabled(&self) -> bool {
        self.respawn
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &SpawnQueue {
        &self.queue
    }

    /// Advances a manual spawn queue (`_spawnNextCluster` path).
    pub fn queue_next(&self) -> Result<()> {
        self.queue.next()
    }

    /// Number of requests currently awaiting correlation.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn registry(&self) -> &PromiseRegistry {
        &self.registry
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Arc<Cluster>> {
        self.clusters.read().get(&id).cloned()
    }

    /// All clusters in id order.
    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().values().cloned().collect()
    }

    /// Partitions the shard space, constructs the cluster set, and drives
    /// the spawn queue until every cluster is up.
    pub async fn spawn(self: &Arc<Self>) -> Result<()> {
        {
            let mut clusters = self.clusters.write();
            if !clusters.is_empty() {
                return Err(ClusterError::Internal(
                    "cluster set already spawned".to_string(),
                ));
            }
            let partitions = partition_shards(&self.shard_list, self.total_clusters as usize);
            for (id, shards) in partitions.into_iter().enumerate() {
                let id = id as ClusterId;
                let cluster =
                    Cluster::new(id, shards, self.total_shards, HashMap::new(), Arc::downgrade(self));
                clusters.insert(id, cluster);
                self.queue.enqueue(id);
            }
        }
        info!(
            clusters = self.total_clusters,
            shards = self.shard_list.len(),
            mode = self.mode.as_str(),
            "spawning cluster set"
        );

        while let Some(id) = self.queue.dequeue() {
            let cluster = self
                .cluster(id)
                .ok_or_else(|| ClusterError::Internal(format!("queued cluster {} missing", id)))?;
            cluster.spawn(Some(self.spawn_timeout)).await?;
            if !self.queue.is_empty() {
                self.queue.wait_for_advance().await;
            }
        }
        Ok(())
    }

    /// Builds the transport for one cluster, including the bootstrap
    /// block (environment in process mode, `WorkerData` in worker mode).
    pub(crate) fn build_transport(
        &self,
        cluster: &Cluster,
    ) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let keep_alive_ms = self
            .keep_alive
            .as_ref()
            .map(|config| config.interval.as_millis() as u64)
            .unwrap_or(0);
        match self.mode {
            ClusterMode::Process => {
                let mut options = self.spawn_options.clone();
                for (key, value) in &self.base_env {
                    options.env.insert(key.clone(), value.clone());
                }
                if let Some(token) = &self.token {
                    options.env.insert(env::TOKEN.to_string(), token.clone());
                }
                options.env.insert(
                    env::CLUSTER_MANAGER_MODE.to_string(),
                    self.mode.as_str().to_string(),
                );
                options
                    .env
                    .insert(env::CLUSTER.to_string(), cluster.id().to_string());
                options.env.insert(
                    env::CLUSTER_COUNT.to_string(),
                    self.total_clusters.to_string(),
                );
                options.env.insert(
                    env::SHARD_LIST.to_string(),
                    cluster
                        .shard_list()
                        .iter()
                        .map(|shard| shard.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                );
                options.env.insert(
                    env::TOTAL_SHARDS.to_string(),
                    self.total_shards.to_string(),
                );
                options.env.insert(
                    env::KEEP_ALIVE_INTERVAL.to_string(),
                    keep_alive_ms.to_string(),
                );
                options.env.insert(
                    env::CLUSTER_QUEUE_MODE.to_string(),
                    self.queue.mode().as_str().to_string(),
                );
                for (key, value) in cluster.env() {
                    options.env.insert(key.clone(), value.clone());
                }
                let (transport, events) = ProcessTransport::spawn(&self.file, &options)?;
                Ok((transport as Arc<dyn Transport>, events))
            }
            ClusterMode::Worker => {
                let launcher = self.worker_launcher.as_ref().ok_or_else(|| {
                    ClusterError::InvalidConfig("worker mode requires a worker launcher".to_string())
                })?;
                let mut worker_env = self.base_env.clone();
                if let Some(token) = &self.token {
                    worker_env.insert(env::TOKEN.to_string(), token.clone());
                }
                for (key, value) in cluster.env() {
                    worker_env.insert(key.clone(), value.clone());
                }
                let data = WorkerData {
                    cluster_id: cluster.id(),
                    shard_list: cluster.shard_list().to_vec(),
                    total_shards: self.total_shards,
                    cluster_count: self.total_clusters,
                    keep_alive_interval_ms: keep_alive_ms,
                    queue_mode: self.queue.mode(),
                    env: worker_env,
                };
                let (transport, events, channel) = WorkerTransport::pair(data);
                launcher.launch(channel);
                Ok((transport as Arc<dyn Transport>, events))
            }
        }
    }

    /// Sends one envelope to every cluster; per-cluster outcomes are
    /// returned so partial delivery is visible.
    pub async fn broadcast(&self, message: Envelope) -> Vec<(ClusterId, Result<()>)> {
        let mut results = Vec::new();
        for cluster in self.clusters() {
            let outcome = cluster.send(message.clone()).await;
            results.push((cluster.id(), outcome));
        }
        results
    }

    /// Evaluates a script on one targeted cluster, or fans out to all of
    /// them and aggregates the replies in arrival order.
    pub async fn broadcast_eval(&self, script: &str, options: BroadcastEvalOptions) -> Result<Value> {
        if options.cluster.is_some() || options.shard.is_some() {
            let target = self
                .resolve_target(options.cluster, options.shard, None)
                .ok_or(ClusterError::TargetClusterNotProvided)?;
            return target.eval(script, options.context, options.timeout).await;
        }
        let context = options.context;
        self.fan_out(options.timeout, TimeoutKind::BroadcastEval, |nonce| {
            Envelope::eval_request(nonce, script, context.clone())
        })
        .await
    }

    /// Fetches a dotted-path client value from one cluster or all of them.
    pub async fn fetch_client_values(&self, prop: &str, options: FetchOptions) -> Result<Value> {
        if options.cluster.is_some() || options.shard.is_some() {
            let target = self
                .resolve_target(options.cluster, options.shard, None)
                .ok_or(ClusterError::TargetClusterNotProvided)?;
            return target.fetch_client_value(prop, options.timeout).await;
        }
        self.fan_out(options.timeout, TimeoutKind::Eval, |nonce| {
            Envelope::fetch_prop_request(nonce, prop)
        })
        .await
    }

    /// Evaluates in the manager's own sandbox.
    pub async fn eval_on_manager(&self, script: &str, context: Option<Value>) -> Result<Value> {
        self.script_host
            .eval(script, context)
            .await
            .map_err(ClusterError::Remote)
    }

    /// Routes an eval to one cluster resolved from explicit id, shard, or
    /// guild id, tagging the waiter with the origin cluster so the reply
    /// envelope finds its way back.
    pub async fn eval_on_cluster(&self, script: &str, options: ClusterEvalOptions) -> Result<Value> {
        let target = self
            .resolve_target(options.cluster, options.shard, options.guild_id)
            .ok_or(ClusterError::TargetClusterNotProvided)?;
        let nonce = options.nonce.unwrap_or_else(generate_nonce);
        let rx = self.registry.register(
            &nonce,
            WaiterOptions {
                timeout: Some(options.timeout),
                timeout_kind: TimeoutKind::Eval,
                request_cluster: options.request_cluster,
                ..Default::default()
            },
        );
        debug!(
            target = target.id(),
            origin = ?options.request_cluster,
            "routing cross-cluster eval"
        );
        if let Err(err) = target
            .send(Envelope::cluster_eval_request(&nonce, script, options.context))
            .await
        {
            self.registry
                .reject(&nonce, RegistryFailure::Channel(err.to_string()));
        }
        promise::wait(rx).await
    }

    /// Respawns every cluster in id order with a pause between them.
    pub async fn respawn_all(&self, options: RespawnOptions) -> Result<()> {
        let clusters = self.clusters();
        let count = clusters.len();
        info!(count, "rolling respawn of all clusters");
        for (index, cluster) in clusters.into_iter().enumerate() {
            cluster
                .respawn(options.respawn_delay, Some(options.timeout))
                .await?;
            if index + 1 < count {
                tokio::time::sleep(options.cluster_delay).await;
            }
        }
        Ok(())
    }

    /// Force-kills every cluster and clears the queue.
    pub async fn shutdown(&self) {
        while self.queue.dequeue().is_some() {}
        for cluster in self.clusters() {
            cluster.kill(true).await;
        }
        info!("cluster manager shut down");
    }

    fn cluster_for_shard(&self, shard: ShardId) -> Option<Arc<Cluster>> {
        self.clusters
            .read()
            .values()
            .find(|cluster| cluster.shard_list().contains(&shard))
            .cloned()
    }

    /// Target resolution order: explicit cluster, then shard lookup, then
    /// guild-derived shard lookup.
    fn resolve_target(
        &self,
        cluster: Option<ClusterId>,
        shard: Option<ShardId>,
        guild_id: Option<u64>,
    ) -> Option<Arc<Cluster>> {
        if let Some(id) = cluster {
            return self.cluster(id);
        }
        if let Some(shard) = shard {
            return self.cluster_for_shard(shard);
        }
        if let Some(guild_id) = guild_id {
            let shard = ((guild_id >> 22) % u64::from(self.total_shards)) as ShardId;
            return self.cluster_for_shard(shard);
        }
        None
    }

    async fn fan_out<F>(
        &self,
        timeout: Option<Duration>,
        timeout_kind: TimeoutKind,
        build: F,
    ) -> Result<Value>
    where
        F: Fn(&str) -> Envelope,
    {
        let clusters: Vec<_> = self
            .clusters()
            .into_iter()
            .filter(|cluster| cluster.is_running())
            .collect();
        if clusters.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let nonce = generate_nonce();
        let rx = self.registry.register(
            &nonce,
            WaiterOptions {
                timeout,
                timeout_kind,
                limit: Some(clusters.len()),
                ..Default::default()
            },
        );
        for cluster in &clusters {
            if let Err(err) = cluster.send(build(&nonce)).await {
                self.registry
                    .reject(&nonce, RegistryFailure::Channel(err.to_string()));
                return Err(ClusterError::Transport(format!(
                    "broadcast to cluster {} failed: {}",
                    cluster.id(),
                    err
                )));
            }
        }
        promise::wait(rx).await
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("mode", &self.mode)
            .field("total_shards", &self.total_shards)
            .field("total_clusters", &self.total_clusters)
            .field("clusters", &self.clusters.read().len())
            .finish()
    }
}
