// # Heartbeat and Restart Budgeting
//
// Liveness for one (cluster, child) pair is a paired timer set: the child
// produces `_keepAlive` beats every interval and scans the ack stream; the
// manager records beats, answers with acks, and scans for silence. A beat
// or ack is considered missed once the gap exceeds the interval plus a
// fixed grace. Heartbeat-driven respawns are bounded per cluster by a
// sliding-window restart counter.

use crate::message::{now_millis, Envelope};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Grace added to the interval before a beat or ack counts as missed.
pub const ACK_GRACE: Duration = Duration::from_millis(2000);

/// Missed acks after which the child tears down its own heartbeat tasks
/// and leaves recovery to the manager-side watchdog.
pub const CHILD_MAX_MISSED_ACKS: u32 = 5;

/// Width of the restart-budget window.
pub const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// Keep-alive policy for one manager. A zero interval disables the
/// heartbeat entirely.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Beat and scan period.
    pub interval: Duration,
    /// Manager-side missed-beat threshold; a respawn is triggered once the
    /// count exceeds it.
    pub max_missed_heartbeats: u32,
    /// Heartbeat-driven respawns allowed per cluster per window.
    pub max_cluster_restarts: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            max_missed_heartbeats: 4,
            max_cluster_restarts: 3,
        }
    }
}

impl KeepAliveConfig {
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Shared beat accounting. `missed` resets to zero on any valid beat.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    pub last: Instant,
    pub missed: u32,
}

impl HeartbeatState {
    fn fresh() -> Self {
        Self {
            last: Instant::now(),
            missed: 0,
        }
    }
}

/// Manager-side heartbeat consumer for one live cluster.
///
/// Owns the periodic scan task; `beat()` is fed by the `_keepAlive`
/// dispatch branch. When the missed count exceeds the configured
/// threshold the `on_unhealthy` callback fires (once per scan) and the
/// owning cluster decides whether the restart budget allows a respawn.
pub struct HeartbeatMonitor {
    state: Arc<Mutex<HeartbeatState>>,
    check_task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start<F>(config: &KeepAliveConfig, on_unhealthy: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(HeartbeatState::fresh()));
        let scan_state = Arc::clone(&state);
        let interval = config.interval;
        let max_missed = config.max_missed_heartbeats;

        let check_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let missed = {
                    let mut state = scan_state.lock();
                    if state.last.elapsed() > interval + ACK_GRACE {
                        state.missed += 1;
                        debug!(missed = state.missed, "heartbeat scan counted a miss");
                        Some(state.missed)
                    } else {
                        None
                    }
                };
                if let Some(missed) = missed {
                    if missed > max_missed {
                        on_unhealthy(missed);
                    }
                }
            }
        });

        Self { state, check_task }
    }

    /// Records a received beat.
    pub fn beat(&self) {
        let mut state = self.state.lock();
        state.last = Instant::now();
        state.missed = 0;
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }

    /// Stops the scan task. Invoked on every transition that stops the
    /// heartbeat; also runs on drop.
    pub fn cleanup(&self) {
        self.check_task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HeartbeatMonitor")
            .field("missed", &state.missed)
            .finish()
    }
}

/// Child-side heartbeat producer and ack consumer.
///
/// Sends `{_keepAlive, last}` every interval and mirrors the manager scan
/// against the ack stream. After `CHILD_MAX_MISSED_ACKS` consecutive
/// misses it stops its own tasks; the child never kills itself.
pub struct HeartbeatProducer {
    state: Arc<Mutex<HeartbeatState>>,
    stopped: Arc<AtomicBool>,
    send_task: JoinHandle<()>,
    check_task: JoinHandle<()>,
}

impl HeartbeatProducer {
    pub fn start(config: &KeepAliveConfig, transport: Arc<dyn Transport>) -> Self {
        let state = Arc::new(Mutex::new(HeartbeatState::fresh()));
        let stopped = Arc::new(AtomicBool::new(false));
        let interval = config.interval;

        let send_stopped = Arc::clone(&stopped);
        let send_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if send_stopped.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = transport.send(&Envelope::keep_alive(now_millis())).await {
                    warn!(error = %err, "failed to send keep-alive beat");
                }
            }
        });

        let send_abort = send_task.abort_handle();
        let scan_state = Arc::clone(&state);
        let scan_stopped = Arc::clone(&stopped);
        let check_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut state = scan_state.lock();
                if state.last.elapsed() > interval + ACK_GRACE {
                    state.missed += 1;
                    if state.missed >= CHILD_MAX_MISSED_ACKS {
                        warn!(
                            missed = state.missed,
                            "no heartbeat acks; tearing down local heartbeat"
                        );
                        drop(state);
                        scan_stopped.store(true, Ordering::Relaxed);
                        send_abort.abort();
                        break;
                    }
                    warn!(missed = state.missed, "missed heartbeat ack");
                }
            }
        });

        Self {
            state,
            stopped,
            send_task,
            check_task,
        }
    }

    /// Records a received ack.
    pub fn ack(&self) {
        let mut state = self.state.lock();
        state.last = Instant::now();
        state.missed = 0;
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }

    /// True once the producer tore itself down after too many missed acks.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn cleanup(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.send_task.abort();
        self.check_task.abort();
    }
}

impl Drop for HeartbeatProducer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for HeartbeatProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatProducer")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Sliding-window counter bounding heartbeat-driven respawns.
///
/// The consume that brings the count to the cap is the last one allowed;
/// at the cap further consumes are denied until the window rolls over.
#[derive(Debug)]
pub struct RestartCounter {
    current: u32,
    window: Duration,
    window_start: Instant,
}

impl RestartCounter {
    pub fn new() -> Self {
        Self::with_window(RESTART_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            current: 0,
            window,
            window_start: Instant::now(),
        }
    }

    fn roll(&mut self) {
        if self.window_start.elapsed() >= self.window {
            self.current = 0;
            self.window_start = Instant::now();
        }
    }

    pub fn current(&mut self) -> u32 {
        self.roll();
        self.current
    }

    /// Attempts to spend one respawn from the budget.
    pub fn try_consume(&mut self, max: u32) -> bool {
        self.roll();
        if self.current >= max {
            return false;
        }
        self.current += 1;
        true
    }
}

impl Default for RestartCounter {
    fn default() -> Self {
        Self::new()
    }
}
