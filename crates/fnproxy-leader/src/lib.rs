//! Leader/Explorer (L): leader election, standalone or over the metastore, with
//! a leader-change notification stream. FAM/BM/IC do not depend on leadership
//! for correctness (each node only manages its own agents); LSS consumes this
//! purely to log/report cluster role.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fnproxy_meta::{MetaStore, TxnOp};
use tokio::sync::watch;
use tracing::{info, warn};

/// Whether this node currently holds leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// This node is the leader.
    Leader,
    /// This node is a follower.
    Follower,
}

/// Leader election with a leader-change notification channel.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Subscribe to leadership changes; the current state is the initial value.
    fn subscribe(&self) -> watch::Receiver<LeaderState>;

    /// Current leadership state.
    fn current(&self) -> LeaderState;
}

/// Always-leader election for single-node/dev operation.
pub struct StandaloneLeader {
    tx: watch::Sender<LeaderState>,
}

impl Default for StandaloneLeader {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(LeaderState::Leader);
        Self { tx }
    }
}

impl LeaderElector for StandaloneLeader {
    fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.tx.subscribe()
    }

    fn current(&self) -> LeaderState {
        *self.tx.borrow()
    }
}

/// Lease-and-campaign election against the metastore: a node holds leadership
/// by periodically re-writing a lease key with a compare-and-swap on the
/// previous value; losing the race (or a lease expiring) demotes to follower
/// and the node re-campaigns on the next tick.
pub struct MetaStoreLeader {
    tx: watch::Sender<LeaderState>,
}

impl MetaStoreLeader {
    /// Start campaigning for `lease_key` as `candidate_id`, re-attempting the
    /// compare-and-swap every `campaign_interval`.
    #[must_use]
    pub fn spawn<M: MetaStore + 'static>(
        store: Arc<M>,
        lease_key: Vec<u8>,
        candidate_id: String,
        campaign_interval: Duration,
    ) -> Arc<Self> {
        let (tx, _rx) = watch::channel(LeaderState::Follower);
        let this = Arc::new(Self { tx });
        let elector = Arc::clone(&this);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(campaign_interval);
            loop {
                ticker.tick().await;
                let holder = store.get(&lease_key).await.ok().flatten();
                let won = match holder {
                    None => true,
                    Some(entry) if entry.value == candidate_id.as_bytes() => true,
                    Some(_) => false,
                };

                let next_state = if won {
                    let write = store
                        .txn(vec![TxnOp::Put {
                            key: lease_key.clone(),
                            value: candidate_id.clone().into_bytes(),
                        }])
                        .await;
                    if write.is_ok() {
                        LeaderState::Leader
                    } else {
                        warn!(candidate = %candidate_id, "leader lease renewal failed");
                        LeaderState::Follower
                    }
                } else {
                    LeaderState::Follower
                };

                if *elector.tx.borrow() != next_state {
                    info!(candidate = %candidate_id, state = ?next_state, "leadership changed");
                }
                let _ = elector.tx.send(next_state);
            }
        });

        this
    }
}

impl LeaderElector for MetaStoreLeader {
    fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.tx.subscribe()
    }

    fn current(&self) -> LeaderState {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_leader_is_always_leader() {
        let elector = StandaloneLeader::default();
        assert_eq!(elector.current(), LeaderState::Leader);
    }

    #[tokio::test]
    async fn metastore_leader_wins_an_uncontested_lease() {
        let store = Arc::new(fnproxy_meta::InMemoryMetaStore::new());
        let elector = MetaStoreLeader::spawn(
            store,
            b"/yr/leader".to_vec(),
            "node-1".to_string(),
            Duration::from_millis(5),
        );
        let mut rx = elector.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LeaderState::Leader);
    }
}
