// # Spawn Queue
//
// Serializes cluster spawns. In `auto` mode the queue advances by itself
// after a fixed inter-spawn delay; in `manual` mode it advances only when
// a child or the host calls `next()` (the `_spawnNextCluster` path).

use crate::error::{ClusterError, Result};
use crate::message::ClusterId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Notify;

/// Queue advance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Auto,
    Manual,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Auto => "auto",
            QueueMode::Manual => "manual",
        }
    }
}

impl FromStr for QueueMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(QueueMode::Auto),
            "manual" => Ok(QueueMode::Manual),
            other => Err(ClusterError::InvalidConfig(format!(
                "unknown queue mode: {}",
                other
            ))),
        }
    }
}

/// Pending spawn order for the manager.
pub struct SpawnQueue {
    mode: QueueMode,
    spawn_delay: Duration,
    pending: Mutex<VecDeque<ClusterId>>,
    advance: Notify,
}

impl SpawnQueue {
    pub fn new(mode: QueueMode, spawn_delay: Duration) -> Self {
        Self {
            mode,
            spawn_delay,
            pending: Mutex::new(VecDeque::new()),
            advance: Notify::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn enqueue(&self, id: ClusterId) {
        self.pending.lock().push_back(id);
    }

    pub fn dequeue(&self) -> Option<ClusterId> {
        self.pending.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Advances a manual queue. Rejected in auto mode. The permit is
    /// stored, so an advance that arrives before the manager starts
    /// waiting is not lost.
    pub fn next(&self) -> Result<()> {
        match self.mode {
            QueueMode::Auto => Err(ClusterError::SpawnQueueAuto),
            QueueMode::Manual => {
                self.advance.notify_one();
                Ok(())
            }
        }
    }

    /// Blocks between spawns: a fixed delay in auto mode, an explicit
    /// `next()` in manual mode.
    pub async fn wait_for_advance(&self) {
        match self.mode {
            QueueMode::Auto => tokio::time::sleep(self.spawn_delay).await,
            QueueMode::Manual => self.advance.notified().await,
        }
    }
}

impl std::fmt::Debug for SpawnQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnQueue")
            .field("mode", &self.mode)
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = SpawnQueue::new(QueueMode::Auto, Duration::from_millis(1));
        queue.enqueue(0);
        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(), Some(0));
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_next_rejected_in_auto_mode() {
        let queue = SpawnQueue::new(QueueMode::Auto, Duration::from_millis(1));
        assert!(matches!(queue.next(), Err(ClusterError::SpawnQueueAuto)));
    }

    #[tokio::test]
    async fn test_auto_advance_sleeps() {
        let queue = SpawnQueue::new(QueueMode::Auto, Duration::from_millis(50));
        let started = Instant::now();
        queue.wait_for_advance().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_manual_advance_waits_for_next() {
        let queue = std::sync::Arc::new(SpawnQueue::new(QueueMode::Manual, Duration::from_millis(1)));

        let waiter = std::sync::Arc::clone(&queue);
        let wait = tokio::spawn(async move {
            waiter.wait_for_advance().await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!wait.is_finished());

        queue.next().unwrap();
        tokio::time::timeout(Duration::from_millis(200), wait)
            .await
            .expect("advance never observed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_early_next_is_not_lost() {
        let queue = SpawnQueue::new(QueueMode::Manual, Duration::from_millis(1));
        queue.next().unwrap();
        tokio::time::timeout(Duration::from_millis(200), queue.wait_for_advance())
            .await
            .expect("stored permit should satisfy the wait");
    }

    #[test]
    fn test_queue_mode_parsing() {
        assert_eq!("auto".parse::<QueueMode>().unwrap(), QueueMode::Auto);
        assert_eq!("manual".parse::<QueueMode>().unwrap(), QueueMode::Manual);
        assert!("sometimes".parse::<QueueMode>().is_err());
        assert_eq!(QueueMode::Manual.as_str(), "manual");
    }
}
