// # Promise Registry
//
// Correlates request nonces with pending waiters. Every outstanding IPC
// request registers exactly one waiter; the waiter is consumed by exactly
// one of resolve, reject, or timeout, and late replies fail the lookup
// silently. Waiters may aggregate: with a `limit` the registry accumulates
// results in arrival order and resolves with the full list.

use crate::error::{ClusterError, Result};
use crate::message::{ClusterId, ErrorPayload};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Slack added on top of a caller-supplied timeout before the waiter is
/// rejected, covering local scheduling jitter.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(100);

/// Which timeout error a waiter rejects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutKind {
    /// Broadcast/eval fan-out: `BroadcastEvalRequestTimedOut`.
    BroadcastEval,
    /// Targeted request: `EvalRequestTimedOut`.
    #[default]
    Eval,
}

impl TimeoutKind {
    pub fn to_error(self) -> ClusterError {
        match self {
            TimeoutKind::BroadcastEval => ClusterError::BroadcastEvalRequestTimedOut,
            TimeoutKind::Eval => ClusterError::EvalRequestTimedOut,
        }
    }
}

/// Why a waiter was rejected. Cloneable so memoized in-flight requests can
/// hand the same failure to every caller.
#[derive(Debug, Clone)]
pub enum RegistryFailure {
    Timeout(TimeoutKind),
    Remote(ErrorPayload),
    Channel(String),
}

impl RegistryFailure {
    pub fn into_error(self) -> ClusterError {
        match self {
            RegistryFailure::Timeout(kind) => kind.to_error(),
            RegistryFailure::Remote(payload) => ClusterError::Remote(payload),
            RegistryFailure::Channel(message) => ClusterError::Transport(message),
        }
    }
}

impl std::fmt::Display for RegistryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryFailure::Timeout(kind) => write!(f, "{}", kind.to_error()),
            RegistryFailure::Remote(payload) => write!(f, "{}", payload),
            RegistryFailure::Channel(message) => write!(f, "channel error: {}", message),
        }
    }
}

pub type WaiterResult = std::result::Result<Value, RegistryFailure>;

/// Per-waiter configuration captured at registration.
#[derive(Debug, Clone, Default)]
pub struct WaiterOptions {
    /// Rejects the waiter `timeout + TIMEOUT_GRACE` after registration.
    pub timeout: Option<Duration>,
    pub timeout_kind: TimeoutKind,
    /// Number of results to accumulate before resolving with the list.
    /// `None` resolves on the first result.
    pub limit: Option<usize>,
    /// Origin cluster of a cross-cluster request, used to route the reply
    /// envelope back.
    pub request_cluster: Option<ClusterId>,
}

struct Waiter {
    tx: oneshot::Sender<WaiterResult>,
    results: Vec<Value>,
    options: WaiterOptions,
    timeout_task: Option<JoinHandle<()>>,
}

/// Nonce-indexed map of pending waiters. Clones share the same map.
#[derive(Clone, Default)]
pub struct PromiseRegistry {
    waiters: Arc<DashMap<String, Waiter>>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a waiter under `nonce` and returns the completion channel.
    /// When `options.timeout` is set, a timer rejects the waiter with the
    /// configured timeout kind and removes the entry.
    pub fn register(&self, nonce: &str, options: WaiterOptions) -> oneshot::Receiver<WaiterResult> {
        let (tx, rx) = oneshot::channel();

        let timeout_task = options.timeout.map(|timeout| {
            let registry = self.clone();
            let nonce = nonce.to_string();
            let kind = options.timeout_kind;
            tokio::spawn(async move {
                tokio::time::sleep(timeout + TIMEOUT_GRACE).await;
                if registry.reject(&nonce, RegistryFailure::Timeout(kind)) {
                    debug!(nonce = %nonce, "request timed out");
                }
            })
        });

        self.waiters.insert(
            nonce.to_string(),
            Waiter {
                tx,
                results: Vec::new(),
                options,
                timeout_task,
            },
        );
        rx
    }

    /// Feeds one result (or error) into the waiter. Errors reject and
    /// remove immediately; results accumulate until `limit` is reached
    /// (or resolve at once when no limit is set). Returns false when no
    /// waiter exists, which is how late replies are dropped.
    pub fn insert_result(
        &self,
        nonce: &str,
        result: std::result::Result<Value, ErrorPayload>,
    ) -> bool {
        match result {
            Err(payload) => self.reject(nonce, RegistryFailure::Remote(payload)),
            Ok(value) => {
                let complete = match self.waiters.get_mut(nonce) {
                    Some(mut waiter) => {
                        waiter.results.push(value);
                        match waiter.options.limit {
                            None => true,
                            Some(limit) => waiter.results.len() >= limit,
                        }
                    }
                    None => {
                        debug!(nonce = %nonce, "dropping reply for unknown nonce");
                        return false;
                    }
                };
                if complete {
                    if let Some((_, waiter)) = self.waiters.remove(nonce) {
                        Self::complete(nonce, waiter);
                    }
                }
                true
            }
        }
    }

    /// Terminal resolve with an explicit value, bypassing accumulation.
    pub fn resolve(&self, nonce: &str, value: Value) -> bool {
        match self.waiters.remove(nonce) {
            Some((_, waiter)) => {
                Self::finish(nonce, waiter, Ok(value));
                true
            }
            None => false,
        }
    }

    /// Terminal reject.
    pub fn reject(&self, nonce: &str, failure: RegistryFailure) -> bool {
        match self.waiters.remove(nonce) {
            Some((_, waiter)) => {
                Self::finish(nonce, waiter, Err(failure));
                true
            }
            None => false,
        }
    }

    /// Reads the origin-cluster routing tag without consuming the waiter.
    pub fn request_cluster(&self, nonce: &str) -> Option<ClusterId> {
        self.waiters
            .get(nonce)
            .and_then(|waiter| waiter.options.request_cluster)
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.waiters.contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn complete(nonce: &str, waiter: Waiter) {
        let value = match waiter.options.limit {
            Some(_) => Value::Array(waiter.results.clone()),
            None => waiter.results.last().cloned().unwrap_or(Value::Null),
        };
        Self::finish(nonce, waiter, Ok(value));
    }

    fn finish(nonce: &str, waiter: Waiter, outcome: WaiterResult) {
        if let Some(task) = &waiter.timeout_task {
            task.abort();
        }
        if waiter.tx.send(outcome).is_err() {
            debug!(nonce = %nonce, "waiter receiver already dropped");
        }
    }
}

impl std::fmt::Debug for PromiseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseRegistry")
            .field("pending", &self.waiters.len())
            .finish()
    }
}

/// Awaits a registered waiter, folding channel loss into an error.
pub async fn wait(rx: oneshot::Receiver<WaiterResult>) -> Result<Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(failure.into_error()),
        Err(_) => Err(ClusterError::Internal(
            "waiter dropped without completion".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_resolve_consumes_waiter() {
        let registry = PromiseRegistry::new();
        let rx = registry.register("n1", WaiterOptions::default());

        assert!(registry.contains("n1"));
        assert!(registry.resolve("n1", json!(7)));
        assert!(!registry.contains("n1"));
        assert_eq!(wait(rx).await.unwrap(), json!(7));

        // Late replies fail the lookup.
        assert!(!registry.insert_result("n1", Ok(json!(8))));
        assert!(!registry.resolve("n1", json!(9)));
    }

    #[tokio::test]
    async fn test_single_result_resolves_without_limit() {
        let registry = PromiseRegistry::new();
        let rx = registry.register("n1", WaiterOptions::default());

        assert!(registry.insert_result("n1", Ok(json!("value"))));
        assert_eq!(wait(rx).await.unwrap(), json!("value"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_limit_aggregates_in_arrival_order() {
        let registry = PromiseRegistry::new();
        let rx = registry.register(
            "agg",
            WaiterOptions {
                limit: Some(3),
                ..Default::default()
            },
        );

        registry.insert_result("agg", Ok(json!(2)));
        registry.insert_result("agg", Ok(json!(0)));
        assert!(registry.contains("agg"));
        registry.insert_result("agg", Ok(json!(1)));

        assert_eq!(wait(rx).await.unwrap(), json!([2, 0, 1]));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_error_rejects_immediately() {
        let registry = PromiseRegistry::new();
        let rx = registry.register(
            "agg",
            WaiterOptions {
                limit: Some(2),
                ..Default::default()
            },
        );

        registry.insert_result("agg", Ok(json!(1)));
        registry.insert_result("agg", Err(ErrorPayload::new("EvalFailed", "boom")));

        match wait(rx).await {
            Err(ClusterError::Remote(payload)) => assert_eq!(payload.name, "EvalFailed"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_removes() {
        let registry = PromiseRegistry::new();
        let started = Instant::now();
        let rx = registry.register(
            "slow",
            WaiterOptions {
                timeout: Some(Duration::from_millis(50)),
                timeout_kind: TimeoutKind::BroadcastEval,
                ..Default::default()
            },
        );

        match wait(rx).await {
            Err(ClusterError::BroadcastEvalRequestTimedOut) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(50) + TIMEOUT_GRACE);
        assert!(!registry.contains("slow"));
    }

    #[tokio::test]
    async fn test_resolve_disarms_timeout() {
        let registry = PromiseRegistry::new();
        let rx = registry.register(
            "fast",
            WaiterOptions {
                timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );

        registry.resolve("fast", json!(true));
        assert_eq!(wait(rx).await.unwrap(), json!(true));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_request_cluster_tag() {
        let registry = PromiseRegistry::new();
        let _rx = registry.register(
            "xc",
            WaiterOptions {
                request_cluster: Some(4),
                ..Default::default()
            },
        );

        assert_eq!(registry.request_cluster("xc"), Some(4));
        assert_eq!(registry.request_cluster("nope"), None);
        // Reading the tag must not consume the waiter.
        assert!(registry.contains("xc"));
    }
}
