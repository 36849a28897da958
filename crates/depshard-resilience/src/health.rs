use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Default cadence between health snapshots.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a `HealthMonitor` needs to read to build a snapshot. The
/// shard manager and transport implement this; `depshard-resilience`
/// itself stays ignorant of their concrete types.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Current dependency-map size per shard.
    fn dependency_map_sizes(&self) -> HashMap<String, usize>;

    /// Whether the in-process queues (ProposeC/CommitC) this node depends
    /// on are present and open.
    fn queues_present(&self) -> bool;

    /// Reachability of each upstream peer this node talks to, probed
    /// through a circuit breaker so a flapping peer doesn't spam checks.
    async fn peer_reachable(&self) -> HashMap<String, bool>;
}

#[derive(Debug, Clone)]
pub struct HealthDetails {
    pub dependency_map_sizes: HashMap<String, usize>,
    pub peer_reachable: HashMap<String, bool>,
    pub queues_present: bool,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub last_check_time: DateTime<Utc>,
    pub details: HealthDetails,
}

impl HealthSnapshot {
    fn initial() -> Self {
        HealthSnapshot {
            is_healthy: true,
            last_check_time: Utc::now(),
            details: HealthDetails {
                dependency_map_sizes: HashMap::new(),
                peer_reachable: HashMap::new(),
                queues_present: true,
            },
        }
    }
}

/// Holds the latest complete health snapshot and refreshes it on a fixed
/// cadence. Readers always see the most recent completed check; a check
/// in progress never partially overwrites the snapshot readers see.
pub struct HealthMonitor {
    snapshot: RwLock<HealthSnapshot>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        HealthMonitor {
            snapshot: RwLock::new(HealthSnapshot::initial()),
        }
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.read().clone()
    }

    /// Run the check loop forever at `interval`. Intended to be spawned as
    /// a background task; cancel by dropping the task handle.
    pub async fn run(self: Arc<Self>, source: Arc<dyn HealthSource>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dependency_map_sizes = source.dependency_map_sizes();
            let queues_present = source.queues_present();
            let peer_reachable = source.peer_reachable().await;
            let is_healthy = queues_present && peer_reachable.values().all(|reachable| *reachable);

            let next = HealthSnapshot {
                is_healthy,
                last_check_time: Utc::now(),
                details: HealthDetails {
                    dependency_map_sizes,
                    peer_reachable,
                    queues_present,
                },
            };
            *self.snapshot.write() = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSource {
        healthy_peer: AtomicBool,
    }

    #[async_trait]
    impl HealthSource for FakeSource {
        fn dependency_map_sizes(&self) -> HashMap<String, usize> {
            let mut m = HashMap::new();
            m.insert("alpha".to_string(), 3);
            m
        }

        fn queues_present(&self) -> bool {
            true
        }

        async fn peer_reachable(&self) -> HashMap<String, bool> {
            let mut m = HashMap::new();
            m.insert("peer-a".to_string(), self.healthy_peer.load(Ordering::SeqCst));
            m
        }
    }

    #[test]
    fn initial_snapshot_is_healthy_with_empty_details() {
        let monitor = HealthMonitor::new();
        let snap = monitor.snapshot();
        assert!(snap.is_healthy);
        assert!(snap.details.dependency_map_sizes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reflects_unhealthy_peer_after_one_tick() {
        let monitor = Arc::new(HealthMonitor::new());
        let source = Arc::new(FakeSource {
            healthy_peer: AtomicBool::new(false),
        });
        let handle = tokio::spawn(monitor.clone().run(source, Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;

        let snap = monitor.snapshot();
        assert!(!snap.is_healthy);
        assert_eq!(snap.details.dependency_map_sizes.get("alpha"), Some(&3));
        handle.abort();
    }
}
