// # IPC Message Envelopes
//
// Wire-level message shapes shared by the manager and cluster sides of the
// fabric. The protocol identifies messages by marker fields (`_ready`,
// `_keepAlive`, `_sEval`, ...) rather than a tagged union, so the envelope
// is a thin wrapper over a JSON object with typed constructors for every
// kind and a classifier that implements the dispatch precedence.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Dense cluster identifier, `0..total_clusters`.
pub type ClusterId = u32;

/// Opaque shard identifier owned by exactly one cluster.
pub type ShardId = u32;

/// Wire field names. These strings are the protocol; they must never drift.
pub mod wire {
    pub const NONCE: &str = "nonce";
    pub const RESULT: &str = "_result";
    pub const ERROR: &str = "_error";
    pub const MESSAGE: &str = "message";

    pub const READY: &str = "_ready";
    pub const DISCONNECT: &str = "_disconnect";
    pub const RECONNECTING: &str = "_reconnecting";
    pub const KEEP_ALIVE: &str = "_keepAlive";
    pub const ACK: &str = "ack";
    pub const LAST: &str = "last";

    pub const EVAL: &str = "_eval";
    pub const EVAL_CONTEXT: &str = "_evalContext";
    pub const FETCH_PROP: &str = "_fetchProp";

    pub const S_EVAL: &str = "_sEval";
    pub const S_EVAL_SHARD: &str = "_sEvalShard";
    pub const S_EVAL_TIMEOUT: &str = "_sEvalTimeout";
    pub const S_FETCH_PROP: &str = "_sFetchProp";
    pub const S_FETCH_PROP_SHARD: &str = "_sFetchPropShard";
    pub const S_MANAGER_EVAL: &str = "_sManagerEval";
    pub const S_MANAGER_EVAL_RESPONSE: &str = "_sManagerEvalResponse";
    pub const S_CLUSTER_EVAL: &str = "_sClusterEval";
    pub const S_CLUSTER_EVAL_REQUEST: &str = "_sClusterEvalRequest";
    pub const S_CLUSTER_EVAL_RESPONSE: &str = "_sClusterEvalResponse";
    pub const S_RESPAWN_ALL: &str = "_sRespawnAll";
    pub const SPAWN_NEXT_CLUSTER: &str = "_spawnNextCluster";

    pub const S_CUSTOM: &str = "_sCustom";
    pub const S_REQUEST: &str = "_sRequest";
    pub const S_REPLY: &str = "_sReply";

    pub const CLUSTER: &str = "cluster";
    pub const SHARD: &str = "shard";
    pub const GUILD_ID: &str = "guildId";
    pub const TIMEOUT: &str = "timeout";
    pub const CLUSTER_DELAY: &str = "clusterDelay";
    pub const RESPAWN_DELAY: &str = "respawnDelay";
    pub const REQUEST_CLUSTER: &str = "requestCluster";
}

/// Classification of an envelope by its marker fields.
///
/// Variants mirror the dispatch tables of the manager-side cluster and the
/// child-side client; `Reply` is a plain `{nonce, _result | _error}`
/// response and `Other` is the catch-all surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Ready,
    Disconnect,
    Reconnecting,
    KeepAlive,
    Ack,
    FetchProp,
    Eval,
    BroadcastFetch,
    BroadcastEval,
    ManagerEval,
    ClusterEval,
    ClusterEvalRequest,
    ClusterEvalResponse,
    ManagerEvalResponse,
    RespawnAll,
    SpawnNextCluster,
    CustomRequest,
    CustomReply,
    Reply,
    Other,
}

/// Error shape carried in `_error` reply members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Flattens a local error into the wire shape. A remote payload that
    /// is merely passing through is preserved as-is.
    pub fn from_cluster_error(err: &ClusterError) -> Self {
        match err {
            ClusterError::Remote(payload) => payload.clone(),
            other => Self::new(other.wire_name().to_string(), other.to_string()),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Milliseconds since the Unix epoch, as carried in `last` fields.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates a locally unique correlation nonce: a millisecond time
/// component plus a random component.
pub fn generate_nonce() -> String {
    format!("{:x}-{:x}", now_millis(), rand::random::<u64>())
}

/// A wire message: a JSON object with marker fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value; returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.set(key, value);
        self
    }

    /// True when the field is present and neither `null` nor `false`.
    pub fn flag(&self, key: &str) -> bool {
        match self.fields.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn nonce(&self) -> Option<&str> {
        self.str_field(wire::NONCE)
    }

    /// Parses an `_error` member, tolerating bare-string errors.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        match self.fields.get(wire::ERROR)? {
            Value::String(s) => Some(ErrorPayload::new("Error", s.clone())),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    pub fn result_value(&self) -> Option<&Value> {
        self.fields.get(wire::RESULT)
    }

    /// Classifies the envelope. First match wins; the order is the dispatch
    /// precedence shared by both sides of the fabric.
    pub fn kind(&self) -> EnvelopeKind {
        if self.flag(wire::READY) {
            EnvelopeKind::Ready
        } else if self.flag(wire::DISCONNECT) {
            EnvelopeKind::Disconnect
        } else if self.flag(wire::RECONNECTING) {
            EnvelopeKind::Reconnecting
        } else if self.flag(wire::KEEP_ALIVE) {
            EnvelopeKind::KeepAlive
        } else if self.flag(wire::ACK) {
            EnvelopeKind::Ack
        } else if self.fields.contains_key(wire::FETCH_PROP) {
            EnvelopeKind::FetchProp
        } else if self.fields.contains_key(wire::EVAL) {
            EnvelopeKind::Eval
        } else if self.fields.contains_key(wire::S_FETCH_PROP) {
            EnvelopeKind::BroadcastFetch
        } else if self.fields.contains_key(wire::S_EVAL) {
            EnvelopeKind::BroadcastEval
        } else if self.fields.contains_key(wire::S_MANAGER_EVAL) {
            EnvelopeKind::ManagerEval
        } else if self.fields.contains_key(wire::S_CLUSTER_EVAL_REQUEST) {
            EnvelopeKind::ClusterEvalRequest
        } else if self.fields.contains_key(wire::S_CLUSTER_EVAL) {
            EnvelopeKind::ClusterEval
        } else if self.flag(wire::S_CLUSTER_EVAL_RESPONSE) {
            EnvelopeKind::ClusterEvalResponse
        } else if self.flag(wire::S_MANAGER_EVAL_RESPONSE) {
            EnvelopeKind::ManagerEvalResponse
        } else if self.flag(wire::S_RESPAWN_ALL) {
            EnvelopeKind::RespawnAll
        } else if self.flag(wire::SPAWN_NEXT_CLUSTER) {
            EnvelopeKind::SpawnNextCluster
        } else if self.flag(wire::S_CUSTOM) {
            if self.flag(wire::S_REPLY) {
                EnvelopeKind::CustomReply
            } else if self.flag(wire::S_REQUEST) {
                EnvelopeKind::CustomRequest
            } else {
                EnvelopeKind::Other
            }
        } else if self.nonce().is_some()
            && (self.fields.contains_key(wire::RESULT) || self.fields.contains_key(wire::ERROR))
        {
            EnvelopeKind::Reply
        } else {
            EnvelopeKind::Other
        }
    }

    // --- typed constructors -------------------------------------------------

    pub fn ready() -> Self {
        Self::new().with(wire::READY, Value::Bool(true))
    }

    pub fn disconnect() -> Self {
        Self::new().with(wire::DISCONNECT, Value::Bool(true))
    }

    pub fn reconnecting() -> Self {
        Self::new().with(wire::RECONNECTING, Value::Bool(true))
    }

    pub fn keep_alive(last_ms: u64) -> Self {
        Self::new()
            .with(wire::KEEP_ALIVE, Value::Bool(true))
            .with(wire::LAST, Value::from(last_ms))
    }

    pub fn ack(last_ms: u64) -> Self {
        Self::new()
            .with(wire::ACK, Value::Bool(true))
            .with(wire::LAST, Value::from(last_ms))
    }

    /// Manager-to-child direct eval.
    pub fn eval_request(nonce: &str, script: &str, context: Option<Value>) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::EVAL, Value::from(script));
        if let Some(ctx) = context {
            env.set(wire::EVAL_CONTEXT, ctx);
        }
        env
    }

    /// Manager-to-child dotted-path fetch.
    pub fn fetch_prop_request(nonce: &str, prop: &str) -> Self {
        Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::FETCH_PROP, Value::from(prop))
    }

    pub fn result_reply(nonce: &str, value: Value) -> Self {
        Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::RESULT, value)
    }

    pub fn error_reply(nonce: &str, payload: &ErrorPayload) -> Self {
        Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::ERROR, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Child-to-manager broadcast eval request.
    pub fn broadcast_eval_request(
        nonce: &str,
        script: &str,
        shard: Option<ShardId>,
        timeout_ms: Option<u64>,
        context: Option<Value>,
    ) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_EVAL, Value::from(script));
        if let Some(shard) = shard {
            env.set(wire::S_EVAL_SHARD, Value::from(shard));
        }
        if let Some(t) = timeout_ms {
            env.set(wire::S_EVAL_TIMEOUT, Value::from(t));
        }
        if let Some(ctx) = context {
            env.set(wire::EVAL_CONTEXT, ctx);
        }
        env
    }

    /// Child-to-manager broadcast fetch request.
    pub fn broadcast_fetch_request(nonce: &str, prop: &str, shard: Option<ShardId>) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_FETCH_PROP, Value::from(prop));
        if let Some(shard) = shard {
            env.set(wire::S_FETCH_PROP_SHARD, Value::from(shard));
        }
        env
    }

    pub fn manager_eval_request(nonce: &str, script: &str, context: Option<Value>) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_MANAGER_EVAL, Value::from(script));
        if let Some(ctx) = context {
            env.set(wire::EVAL_CONTEXT, ctx);
        }
        env
    }

    pub fn manager_eval_response(
        nonce: &str,
        result: std::result::Result<Value, &ErrorPayload>,
    ) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_MANAGER_EVAL_RESPONSE, Value::Bool(true));
        match result {
            Ok(value) => env.set(wire::RESULT, value),
            Err(payload) => env.set(
                wire::ERROR,
                serde_json::to_value(payload).unwrap_or(Value::Null),
            ),
        }
        env
    }

    /// Child-to-manager cross-cluster eval.
    #[allow(clippy::too_many_arguments)]
    pub fn cluster_eval(
        nonce: &str,
        script: &str,
        cluster: Option<ClusterId>,
        shard: Option<ShardId>,
        guild_id: Option<u64>,
        timeout_ms: Option<u64>,
        context: Option<Value>,
    ) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_CLUSTER_EVAL, Value::from(script));
        if let Some(cluster) = cluster {
            env.set(wire::CLUSTER, Value::from(cluster));
        }
        if let Some(shard) = shard {
            env.set(wire::SHARD, Value::from(shard));
        }
        if let Some(guild_id) = guild_id {
            env.set(wire::GUILD_ID, Value::from(guild_id));
        }
        if let Some(t) = timeout_ms {
            env.set(wire::TIMEOUT, Value::from(t));
        }
        if let Some(ctx) = context {
            env.set(wire::EVAL_CONTEXT, ctx);
        }
        env
    }

    /// Manager-to-target-cluster eval carrying the originator's nonce.
    pub fn cluster_eval_request(nonce: &str, script: &str, context: Option<Value>) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_CLUSTER_EVAL_REQUEST, Value::from(script));
        if let Some(ctx) = context {
            env.set(wire::EVAL_CONTEXT, ctx);
        }
        env
    }

    pub fn cluster_eval_response(
        nonce: &str,
        result: std::result::Result<Value, &ErrorPayload>,
    ) -> Self {
        let mut env = Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_CLUSTER_EVAL_RESPONSE, Value::Bool(true));
        match result {
            Ok(value) => env.set(wire::RESULT, value),
            Err(payload) => env.set(
                wire::ERROR,
                serde_json::to_value(payload).unwrap_or(Value::Null),
            ),
        }
        env
    }

    pub fn respawn_all(cluster_delay_ms: u64, respawn_delay_ms: u64, timeout_ms: u64) -> Self {
        Self::new()
            .with(wire::S_RESPAWN_ALL, Value::Bool(true))
            .with(wire::CLUSTER_DELAY, Value::from(cluster_delay_ms))
            .with(wire::RESPAWN_DELAY, Value::from(respawn_delay_ms))
            .with(wire::TIMEOUT, Value::from(timeout_ms))
    }

    pub fn spawn_next_cluster() -> Self {
        Self::new().with(wire::SPAWN_NEXT_CLUSTER, Value::Bool(true))
    }

    pub fn custom_request(nonce: &str, message: Value) -> Self {
        Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_CUSTOM, Value::Bool(true))
            .with(wire::S_REQUEST, Value::Bool(true))
            .with(wire::MESSAGE, message)
    }

    pub fn custom_reply(nonce: &str, message: Value) -> Self {
        Self::new()
            .with(wire::NONCE, Value::from(nonce))
            .with(wire::S_CUSTOM, Value::Bool(true))
            .with(wire::S_REPLY, Value::Bool(true))
            .with(wire::MESSAGE, message)
    }
}

/// An uncategorized inbound message surfaced to the application.
#[derive(Debug, Clone)]
pub struct IpcMessage {
    raw: Envelope,
}

impl IpcMessage {
    pub fn new(raw: Envelope) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Envelope {
        &self.raw
    }

    pub fn into_raw(self) -> Envelope {
        self.raw
    }

    pub fn nonce(&self) -> Option<&str> {
        self.raw.nonce()
    }

    /// The application payload (`message` field), when present.
    pub fn payload(&self) -> Option<&Value> {
        self.raw.get(wire::MESSAGE)
    }

    pub fn is_request(&self) -> bool {
        self.raw.flag(wire::S_CUSTOM) && self.raw.flag(wire::S_REQUEST)
    }

    /// Builds the `_sCustom`/`_sReply` response echoing this message's
    /// nonce. The caller ships it over its own facade.
    pub fn reply_envelope(&self, data: Value) -> Result<Envelope> {
        let nonce = self
            .nonce()
            .ok_or_else(|| ClusterError::Internal("cannot reply to a message without a nonce".to_string()))?;
        Ok(Envelope::custom_reply(nonce, data))
    }
}
