// Cluster Fabric Integration Test
//
// Drives a full manager + worker-mode cluster set through the IPC fabric:
// ready handshakes, broadcast and targeted eval/fetch, cross-cluster
// routing, custom request/reply in both directions, the manual spawn
// queue, rolling respawns, and the heartbeat watchdog with its restart
// budget.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusty_cluster::heartbeat::ACK_GRACE;
use rusty_cluster::script::ScriptResult;
use rusty_cluster::{
    BroadcastEvalOptions, ClientEvalOptions, ClusterClient, ClusterError, ClusterEvalOptions,
    ClusterId, ClusterManager, ClusterManagerOptions, ClusterMode, CommandScriptHost, Envelope,
    EventKind, EventPayload, FetchOptions, KeepAliveConfig, QueueMode, RespawnOptions, ScriptHost,
    WorkerChannel,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Script host used by test workers: a whitelist host plus one operation
/// that never returns, for timeout scenarios.
struct TestHost {
    inner: CommandScriptHost,
}

impl TestHost {
    fn new() -> Self {
        Self {
            inner: CommandScriptHost::new(),
        }
    }
}

#[async_trait]
impl ScriptHost for TestHost {
    async fn eval(&self, script: &str, context: Option<Value>) -> ScriptResult {
        if script == "block" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.eval(script, context).await
    }

    async fn fetch_prop(&self, path: &str) -> Value {
        self.inner.fetch_prop(path).await
    }
}

/// How a test worker behaves after it is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildBehavior {
    /// Signal ready and run the full client (heartbeat included).
    Ready,
    /// Signal ready on the wire but never start the heartbeat producer.
    SilentReady,
    /// Signal a disconnect instead of becoming ready.
    Disconnect,
    /// Never signal anything.
    Mute,
    /// Drop the channel immediately, like a crash on startup.
    Die,
    /// Crash right after signalling ready, but only on the first launch.
    DieAfterReady,
}

struct Fabric {
    manager: Arc<ClusterManager>,
    clients: Arc<Mutex<HashMap<ClusterId, Arc<ClusterClient>>>>,
    launches: Arc<Mutex<HashMap<ClusterId, usize>>>,
}

impl Fabric {
    fn build(
        behavior: ChildBehavior,
        configure: impl FnOnce(&mut ClusterManagerOptions),
    ) -> Arc<ClusterManager> {
        Self::new(behavior, configure).manager
    }

    fn new(behavior: ChildBehavior, configure: impl FnOnce(&mut ClusterManagerOptions)) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let clients: Arc<Mutex<HashMap<ClusterId, Arc<ClusterClient>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let launches: Arc<Mutex<HashMap<ClusterId, usize>>> = Arc::new(Mutex::new(HashMap::new()));

        let launcher_clients = Arc::clone(&clients);
        let launcher_launches = Arc::clone(&launches);
        let launcher = move |channel: WorkerChannel| {
            if behavior == ChildBehavior::Die {
                drop(channel);
                return;
            }
            let clients = Arc::clone(&launcher_clients);
            let launches = Arc::clone(&launcher_launches);
            tokio::spawn(async move {
                let id = channel.data.cluster_id;
                let launch = {
                    let mut launches = launches.lock();
                    let entry = launches.entry(id).or_insert(0);
                    *entry += 1;
                    *entry
                };

                if behavior == ChildBehavior::DieAfterReady && launch == 1 {
                    let _ = channel.to_parent.send(Envelope::ready());
                    drop(channel);
                    return;
                }

                let host = Arc::new(TestHost::new());
                host.inner.set_state(json!({
                    "stats": {"cluster": id, "gen": launch},
                }));
                host.inner.register("two", |_| Ok(json!(2)));
                host.inner
                    .register("cluster-id", move |_| Ok(json!(id)));
                host.inner
                    .register("echo-ctx", |ctx| Ok(ctx.unwrap_or(Value::Null)));

                let client =
                    ClusterClient::from_worker(channel, host as Arc<dyn ScriptHost>);

                // Application-level responder: answers ping requests only,
                // anything else is left to time out.
                let responder = Arc::clone(&client);
                client.events().on(EventKind::ClientRequest, move |payload| {
                    if let EventPayload::Message { message, .. } = payload {
                        let is_ping = message
                            .payload()
                            .and_then(|payload| payload.get("op"))
                            .map(|op| op == &json!("ping"))
                            .unwrap_or(false);
                        if !is_ping {
                            return;
                        }
                        if let Ok(reply) = message.reply_envelope(json!("pong")) {
                            let client = Arc::clone(&responder);
                            tokio::spawn(async move {
                                let _ = client.send(reply).await;
                            });
                        }
                    }
                });

                match behavior {
                    ChildBehavior::Ready | ChildBehavior::DieAfterReady => {
                        let _ = client.notify_ready().await;
                    }
                    ChildBehavior::SilentReady => {
                        let _ = client.send(Envelope::ready()).await;
                    }
                    ChildBehavior::Disconnect => {
                        let _ = client.notify_disconnect().await;
                    }
                    ChildBehavior::Mute => {}
                    ChildBehavior::Die => unreachable!(),
                }
                clients.lock().insert(id, client);
            });
        };

        let mut options = ClusterManagerOptions {
            mode: ClusterMode::Worker,
            total_shards: 4,
            total_clusters: Some(2),
            keep_alive: None,
            respawn: false,
            spawn_delay: Duration::from_millis(10),
            spawn_timeout: Duration::from_millis(5000),
            worker_launcher: Some(Arc::new(launcher)),
            ..Default::default()
        };
        configure(&mut options);

        Self {
            manager: ClusterManager::new(options).expect("manager options should be valid"),
            clients,
            launches,
        }
    }

    async fn client(&self, id: ClusterId) -> Arc<ClusterClient> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(client) = self.clients.lock().get(&id).cloned() {
                return client;
            }
            assert!(
                Instant::now() < deadline,
                "worker client {} never appeared",
                id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn launches(&self, id: ClusterId) -> usize {
        self.launches.lock().get(&id).copied().unwrap_or(0)
    }
}

async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_spawn_partitions_and_ready_handshake() {
    let fabric = Fabric::new(ChildBehavior::Ready, |options| {
        options.total_shards = 5;
        options.total_clusters = Some(2);
    });
    fabric.manager.spawn().await.unwrap();

    let clusters = fabric.manager.clusters();
    assert_eq!(clusters.len(), 2);
    assert!(clusters.iter().all(|cluster| cluster.ready()));

    // The partition covers 0..5 contiguously with sizes differing by one.
    let shards: Vec<u32> = clusters
        .iter()
        .flat_map(|cluster| cluster.shard_list().to_vec())
        .collect();
    assert_eq!(shards, vec![0, 1, 2, 3, 4]);
    assert_eq!(clusters[0].shard_list().len(), 3);
    assert_eq!(clusters[1].shard_list().len(), 2);

    // The workers observed matching bootstrap facts.
    let client = fabric.client(1).await;
    assert_eq!(client.ids(), clusters[1].shard_list());
    assert_eq!(client.count(), 2);
}

#[tokio::test]
async fn test_spawn_rejects_on_disconnect_before_ready() {
    let manager = Fabric::build(ChildBehavior::Disconnect, |_| {});
    match manager.spawn().await {
        Err(ClusterError::ReadyDisconnected(0)) => {}
        other => panic!("unexpected spawn outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_spawn_rejects_on_immediate_death() {
    let manager = Fabric::build(ChildBehavior::Die, |_| {});
    match manager.spawn().await {
        Err(ClusterError::ReadyDied(0)) => {}
        other => panic!("unexpected spawn outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_spawn_rejects_on_ready_timeout() {
    let manager = Fabric::build(ChildBehavior::Mute, |options| {
        options.spawn_timeout = Duration::from_millis(300);
    });
    match manager.spawn().await {
        Err(ClusterError::ReadyTimeout(0, _)) => {}
        other => panic!("unexpected spawn outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_broadcast_eval_aggregates_over_all_clusters() {
    let manager = Fabric::build(ChildBehavior::Ready, |options| {
        options.total_shards = 3;
        options.total_clusters = Some(3);
    });
    manager.spawn().await.unwrap();

    let result = manager
        .broadcast_eval("two", BroadcastEvalOptions::default())
        .await
        .unwrap();
    let values = result.as_array().expect("broadcast yields a list");
    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|value| value == &json!(2)));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn test_broadcast_eval_targeted_cluster_and_context() {
    let manager = Fabric::build(ChildBehavior::Ready, |_| {});
    manager.spawn().await.unwrap();

    let value = manager
        .broadcast_eval(
            "cluster-id",
            BroadcastEvalOptions {
                cluster: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(value, json!(1));

    let echoed = manager
        .broadcast_eval(
            "echo-ctx",
            BroadcastEvalOptions {
                shard: Some(0),
                context: Some(json!({"k": 7})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(echoed, json!({"k": 7}));

    let err = manager
        .broadcast_eval(
            "two",
            BroadcastEvalOptions {
                cluster: Some(99),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::TargetClusterNotProvided));
}

#[tokio::test]
async fn test_fetch_client_values_dotted_paths() {
    let manager = Fabric::build(ChildBehavior::Ready, |_| {});
    manager.spawn().await.unwrap();

    let all = manager
        .fetch_client_values("stats.cluster", FetchOptions::default())
        .await
        .unwrap();
    let mut ids: Vec<i64> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);

    let one = manager
        .fetch_client_values(
            "stats.cluster",
            FetchOptions {
                cluster: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(one, json!(1));

    // A missing segment resolves to null, the wire's undefined.
    let missing = manager
        .fetch_client_values(
            "stats.missing.deep",
            FetchOptions {
                cluster: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(missing, Value::Null);
}

#[tokio::test]
async fn test_broadcast_timeout_rejects_and_clears_waiter() {
    let manager = Fabric::build(ChildBehavior::Ready, |_| {});
    manager.spawn().await.unwrap();

    let started = Instant::now();
    let outcome = manager
        .broadcast_eval(
            "block",
            BroadcastEvalOptions {
                timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        )
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Err(ClusterError::BroadcastEvalRequestTimedOut) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    // timeout + 100ms grace, with scheduling slack on top
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_millis(2000));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn test_cross_cluster_eval_routes_reply_to_origin() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    let origin = fabric.client(0).await;
    let value = origin
        .eval_on_cluster(
            "cluster-id",
            ClusterEvalOptions {
                cluster: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(value, json!(1));

    // Shard-based and guild-based targeting resolve through the same path.
    let by_shard = origin
        .eval_on_cluster(
            "cluster-id",
            ClusterEvalOptions {
                shard: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_shard, json!(0));

    // guild 3 << 22 maps to shard 3, owned by cluster 1.
    let by_guild = origin
        .eval_on_cluster(
            "cluster-id",
            ClusterEvalOptions {
                guild_id: Some(3u64 << 22),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_guild, json!(1));
}

#[tokio::test]
async fn test_cross_cluster_eval_without_target_fails() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    let origin = fabric.client(0).await;
    let err = origin
        .eval_on_cluster("cluster-id", ClusterEvalOptions::default())
        .await
        .unwrap_err();
    match err {
        ClusterError::Remote(payload) => {
            assert_eq!(payload.name, "TargetClusterNotProvided");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_child_broadcast_and_manager_eval() {
    let fabric = Fabric::new(ChildBehavior::Ready, |options| {
        let host = CommandScriptHost::new();
        host.register("uptime", |_| Ok(json!("manager-up")));
        options.script_host = Some(Arc::new(host));
    });
    fabric.manager.spawn().await.unwrap();
    let client = fabric.client(0).await;

    let values = client
        .broadcast_eval("two", ClientEvalOptions::default())
        .await
        .unwrap();
    assert_eq!(values, json!([2, 2]));

    let fetched = client
        .fetch_client_values("stats.cluster", None, None)
        .await
        .unwrap();
    let mut ids: Vec<i64> = fetched
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);

    let manager_value = client.eval_on_manager("uptime", None, None).await.unwrap();
    assert_eq!(manager_value, json!("manager-up"));

    let err = client
        .eval_on_manager("not-allowed", None, None)
        .await
        .unwrap_err();
    match err {
        ClusterError::Remote(payload) => assert_eq!(payload.name, "InvalidScript"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_request_round_trips_both_directions() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    // Manager -> child: the worker's responder answers "pong".
    let cluster = fabric.manager.cluster(0).unwrap();
    let reply = cluster
        .request(json!({"op": "ping"}), Some(Duration::from_secs(5)))
        .await;
    assert_eq!(reply.get("message"), Some(&json!("pong")));
    assert!(reply.get("error").is_none());

    // Child -> manager: the host application answers on the cluster bus.
    let answering = fabric.manager.cluster(1).unwrap();
    let answer_via = Arc::clone(&answering);
    answering.events().on(EventKind::ClientRequest, move |payload| {
        if let EventPayload::Message { message, .. } = payload {
            if let Ok(reply) = message.reply_envelope(json!("host-pong")) {
                let cluster = Arc::clone(&answer_via);
                tokio::spawn(async move {
                    let _ = cluster.send(reply).await;
                });
            }
        }
    });

    let client = fabric.client(1).await;
    let reply = client
        .request(json!({"op": "host-ping"}), Some(Duration::from_secs(5)))
        .await;
    assert_eq!(reply.get("message"), Some(&json!("host-pong")));
}

#[tokio::test]
async fn test_request_folds_timeout_into_value() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    // The worker's responder ignores this op, so the request resolves
    // with the original message plus an error field.
    let cluster = fabric.manager.cluster(1).unwrap();
    let _client = fabric.client(1).await;

    let value = cluster
        .request(json!({"op": "unanswered"}), Some(Duration::from_millis(200)))
        .await;
    assert_eq!(value.get("op"), Some(&json!("unanswered")));
    let error = value.get("error").and_then(Value::as_str).unwrap();
    assert!(error.contains("timed out"), "unexpected error: {}", error);
}

#[tokio::test]
async fn test_manual_spawn_queue_advances_on_request() {
    let fabric = Fabric::new(ChildBehavior::Ready, |options| {
        options.queue_mode = QueueMode::Manual;
    });

    let manager = Arc::clone(&fabric.manager);
    let spawning = tokio::spawn(async move { manager.spawn().await });

    // Cluster 0 comes up; cluster 1 must wait for the explicit advance.
    assert!(
        wait_until(Duration::from_secs(5), || {
            fabric
                .manager
                .cluster(0)
                .map(|cluster| cluster.ready())
                .unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fabric.manager.cluster(1).unwrap().is_running());
    assert!(!spawning.is_finished());

    fabric.client(0).await.spawn_next_cluster().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), spawning)
        .await
        .expect("spawn should finish after the advance")
        .unwrap()
        .unwrap();
    assert!(fabric.manager.cluster(1).unwrap().ready());

    // Advancing an auto queue is an error for the host as well.
    let auto = Fabric::build(ChildBehavior::Ready, |_| {});
    assert!(matches!(auto.queue_next(), Err(ClusterError::SpawnQueueAuto)));
}

#[tokio::test]
async fn test_respawn_serves_post_respawn_values() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    let cluster = fabric.manager.cluster(0).unwrap();
    let gen = cluster.fetch_client_value("stats.gen", None).await.unwrap();
    assert_eq!(gen, json!(1));

    cluster
        .respawn(Duration::from_millis(50), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(cluster.ready());
    assert_eq!(fabric.launches(0), 2);

    let gen = cluster.fetch_client_value("stats.gen", None).await.unwrap();
    assert_eq!(gen, json!(2));
}

#[tokio::test]
async fn test_respawn_all_from_child_request() {
    let fabric = Fabric::new(ChildBehavior::Ready, |_| {});
    fabric.manager.spawn().await.unwrap();

    let client = fabric.client(0).await;
    client
        .respawn_all(RespawnOptions {
            cluster_delay: Duration::from_millis(50),
            respawn_delay: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            fabric.launches(0) == 2 && fabric.launches(1) == 2
        })
        .await,
        "both clusters should be relaunched"
    );
    assert!(
        wait_until(Duration::from_secs(5), || {
            fabric.manager.clusters().iter().all(|cluster| cluster.ready())
        })
        .await
    );
}

#[tokio::test]
async fn test_auto_respawn_after_child_death() {
    let fabric = Fabric::new(ChildBehavior::DieAfterReady, |options| {
        options.respawn = true;
        options.total_shards = 1;
        options.total_clusters = Some(1);
    });
    fabric.manager.spawn().await.unwrap();

    // The first child crashes right after the handshake; the exit-driven
    // respawn brings up a healthy replacement without consuming the
    // heartbeat restart budget.
    let cluster = fabric.manager.cluster(0).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            fabric.launches(0) == 2 && cluster.ready()
        })
        .await,
        "cluster should be relaunched after the crash"
    );
    assert_eq!(cluster.restarts(), 0);

    // A manager-initiated kill must NOT auto-respawn.
    cluster.kill(false).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!cluster.is_running());
    assert_eq!(fabric.launches(0), 2);
}

#[tokio::test]
async fn test_shutdown_kills_all_clusters() {
    let manager = Fabric::build(ChildBehavior::Ready, |_| {});
    manager.spawn().await.unwrap();
    assert!(manager.clusters().iter().all(|cluster| cluster.is_running()));

    manager.shutdown().await;
    assert!(manager.clusters().iter().all(|cluster| !cluster.is_running()));
    assert!(manager.clusters().iter().all(|cluster| !cluster.ready()));

    // Sends to a dead cluster surface NoChildExists.
    let err = manager
        .cluster(0)
        .unwrap()
        .send(Envelope::spawn_next_cluster())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NoChildExists(0)));
}

#[tokio::test]
async fn test_heartbeat_watchdog_respawns_within_budget() {
    let fabric = Fabric::new(ChildBehavior::SilentReady, |options| {
        options.total_shards = 1;
        options.total_clusters = Some(1);
        options.keep_alive = Some(KeepAliveConfig {
            interval: Duration::from_millis(50),
            max_missed_heartbeats: 1,
            max_cluster_restarts: 2,
        });
    });
    fabric.manager.spawn().await.unwrap();

    let cluster = fabric.manager.cluster(0).unwrap();
    assert_eq!(cluster.restarts(), 0);

    let respawn_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&respawn_events);
    cluster.events().on(EventKind::Spawn, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    // The silent child never beats: each cycle needs interval + ACK_GRACE
    // of silence before misses accumulate and the watchdog respawns.
    assert!(
        wait_until(ACK_GRACE * 4 + Duration::from_secs(4), || cluster.restarts() == 2).await,
        "watchdog should consume the whole restart budget"
    );

    // The budget is exhausted: the next watchdog trigger is denied, the
    // cluster keeps its (still silent) child, and the counter stays put.
    tokio::time::sleep(ACK_GRACE + Duration::from_millis(1200)).await;
    assert_eq!(cluster.restarts(), 2);
    assert_eq!(respawn_events.load(Ordering::Relaxed), 2);
    assert!(cluster.is_running());
    assert_eq!(fabric.launches(0), 3);
}
