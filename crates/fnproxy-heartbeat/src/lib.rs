//! Heartbeat Controller (H): installs a periodic probe per peer and invokes a
//! "lost" callback exactly once after `N` consecutive misses at interval `T`.
//! Re-adding a peer replaces its prior probe atomically.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Performs the actual liveness check against a peer's address.
///
/// Kept pluggable so tests can simulate loss without a real transport.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `address`, returning `true` if the peer responded in time.
    async fn probe(&self, address: &str) -> bool;
}

struct PeerEntry {
    task: JoinHandle<()>,
}

/// Configuration for a heartbeat controller.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Consecutive misses tolerated before declaring the peer lost.
    pub miss_count: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            miss_count: 10,
        }
    }
}

/// The Heartbeat Controller: `Add`/`Delete` a per-peer periodic probe.
pub struct HeartbeatController<P: Prober + 'static> {
    prober: Arc<P>,
    config: HeartbeatConfig,
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl<P: Prober + 'static> HeartbeatController<P> {
    /// Construct a controller around the given prober and config.
    #[must_use]
    pub fn new(prober: P, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            prober: Arc::new(prober),
            config,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Install a periodic probe for `peer_id` at `address`. `on_lost` fires exactly
    /// once after `miss_count` consecutive failed probes. Replaces any existing
    /// probe for the same `peer_id` atomically.
    pub fn add<F>(self: &Arc<Self>, peer_id: impl Into<String>, address: impl Into<String>, on_lost: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let peer_id = peer_id.into();
        let address = address.into();
        let this = Arc::clone(self);
        let probe_peer_id = peer_id.clone();

        let task = tokio::spawn(async move {
            let mut consecutive_misses = 0u32;
            let mut ticker = tokio::time::interval(this.config.interval);
            loop {
                ticker.tick().await;
                if this.prober.probe(&address).await {
                    consecutive_misses = 0;
                } else {
                    consecutive_misses += 1;
                    warn!(peer_id = %probe_peer_id, consecutive_misses, "heartbeat probe missed");
                    if consecutive_misses >= this.config.miss_count {
                        warn!(peer_id = %probe_peer_id, "heartbeat lost, invoking callback");
                        on_lost(probe_peer_id.clone());
                        this.peers.lock().remove(&probe_peer_id);
                        return;
                    }
                }
            }
        });

        let previous = self.peers.lock().insert(peer_id.clone(), PeerEntry { task });
        if let Some(previous) = previous {
            previous.task.abort();
            info!(%peer_id, "replaced existing heartbeat probe");
        }
    }

    /// Remove the probe for `peer_id`, if any.
    pub fn delete(&self, peer_id: &str) {
        if let Some(entry) = self.peers.lock().remove(peer_id) {
            entry.task.abort();
        }
    }

    /// Whether a probe is currently installed for `peer_id`.
    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.lock().contains_key(peer_id)
    }
}

/// Object-safe view of a [`HeartbeatController`], so callers that don't care
/// which `Prober` backs it can hold `Arc<dyn HeartbeatHandle>`.
pub trait HeartbeatHandle: Send + Sync {
    /// See [`HeartbeatController::add`].
    fn add_peer(&self, peer_id: String, address: String, on_lost: Box<dyn Fn(String) + Send + Sync>);

    /// See [`HeartbeatController::delete`].
    fn delete_peer(&self, peer_id: &str);
}

impl<P: Prober + 'static> HeartbeatHandle for Arc<HeartbeatController<P>> {
    fn add_peer(&self, peer_id: String, address: String, on_lost: Box<dyn Fn(String) + Send + Sync>) {
        self.add(peer_id, address, on_lost);
    }

    fn delete_peer(&self, peer_id: &str) {
        self.delete(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct AlwaysFails;

    #[async_trait]
    impl Prober for AlwaysFails {
        async fn probe(&self, _address: &str) -> bool {
            false
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl Prober for AlwaysSucceeds {
        async fn probe(&self, _address: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn fires_on_lost_after_miss_count() {
        let controller = HeartbeatController::new(
            AlwaysFails,
            HeartbeatConfig { interval: Duration::from_millis(5), miss_count: 3 },
        );
        let lost = Arc::new(AtomicBool::new(false));
        let lost_clone = Arc::clone(&lost);
        controller.add("a1", "127.0.0.1:1", move |_| {
            lost_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(lost.load(Ordering::SeqCst));
        assert!(!controller.contains("a1"));
    }

    #[tokio::test]
    async fn healthy_peer_never_fires_on_lost() {
        let controller = HeartbeatController::new(
            AlwaysSucceeds,
            HeartbeatConfig { interval: Duration::from_millis(5), miss_count: 2 },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        controller.add("a1", "127.0.0.1:1", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        controller.delete("a1");
    }

    #[tokio::test]
    async fn re_add_replaces_prior_probe() {
        let controller = HeartbeatController::new(
            AlwaysFails,
            HeartbeatConfig { interval: Duration::from_millis(1000), miss_count: 1 },
        );
        controller.add("a1", "addr-1", |_| {});
        controller.add("a1", "addr-2", |_| {});
        assert!(controller.contains("a1"));
        controller.delete("a1");
        assert!(!controller.contains("a1"));
    }
}
