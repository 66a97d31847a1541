//! Generic request/response correlation for agent RPCs.
//!
//! Replaces the source's per-call-type synchronizer macro: one generic type
//! parameterized by response type serves every call kind (deploy, kill,
//! query, update-cred). A duplicate `(agent_id, request_id)` joins the
//! existing wait rather than issuing a second RPC; a stale response arriving
//! after the correlator has already been settled (e.g. by a heartbeat-loss
//! `TimeoutEvent`) is silently dropped.

use std::collections::HashMap;

use fnproxy_core::{AgentId, ProxyError, RequestId, Result};
use tokio::sync::watch;

type Settled<T> = Option<Result<T>>;

/// Tracks in-flight correlated calls for one RPC kind.
pub struct Correlator<T: Clone + Send + Sync + 'static> {
    inflight: HashMap<(AgentId, RequestId), watch::Sender<Settled<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Correlator<T> {
    /// Construct an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self { inflight: HashMap::new() }
    }

    /// Begin (or join) a correlated call. Returns `true` if this is a fresh call the
    /// caller must now actually dispatch, plus a receiver that resolves once the call
    /// settles (by this caller's own dispatch, or by whichever caller's dispatch wins).
    pub fn begin(&mut self, key: (AgentId, RequestId)) -> (bool, watch::Receiver<Settled<T>>) {
        if let Some(sender) = self.inflight.get(&key) {
            return (false, sender.subscribe());
        }
        let (tx, rx) = watch::channel(None);
        self.inflight.insert(key, tx);
        (true, rx)
    }

    /// Settle a call with its outcome. A second settlement for the same key (a stale,
    /// superseded response) is a no-op: the correlator only honors the first.
    pub fn settle(&mut self, key: (AgentId, RequestId), result: Result<T>) {
        if let Some(sender) = self.inflight.remove(&key) {
            let _ = sender.send(Some(result));
        }
    }

    /// Settle and remove every in-flight call for `agent_id` with the same error,
    /// e.g. when a `TimeoutEvent` fires so no caller is left hanging.
    pub fn clear_agent(&mut self, agent_id: AgentId, error: ProxyError) {
        let keys: Vec<_> = self.inflight.keys().filter(|(a, _)| *a == agent_id).cloned().collect();
        for key in keys {
            self.settle(key, Err(error.clone()));
        }
    }
}

/// Await a correlator receiver until it settles, ignoring the `None` start value.
pub async fn await_settled<T: Clone>(mut rx: watch::Receiver<Settled<T>>) -> Result<T> {
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(ProxyError::InnerCommunication("correlator dropped before settling".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_request_id_joins_existing_call() {
        let mut correlator: Correlator<u32> = Correlator::new();
        let agent = AgentId::from_bytes([1u8; 32]);
        let req = RequestId::from_bytes([2u8; 32]);

        let (first_is_fresh, rx1) = correlator.begin((agent, req));
        let (second_is_fresh, rx2) = correlator.begin((agent, req));
        assert!(first_is_fresh);
        assert!(!second_is_fresh);

        correlator.settle((agent, req), Ok(7));
        assert_eq!(await_settled(rx1).await.unwrap(), 7);
        assert_eq!(await_settled(rx2).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn late_duplicate_settlement_is_dropped() {
        let mut correlator: Correlator<u32> = Correlator::new();
        let key = (AgentId::from_bytes([1u8; 32]), RequestId::from_bytes([2u8; 32]));
        let (_, rx) = correlator.begin(key);
        correlator.settle(key, Ok(1));
        correlator.settle(key, Ok(2)); // already removed; no-op
        assert_eq!(await_settled(rx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_agent_settles_every_pending_call_for_that_agent() {
        let mut correlator: Correlator<u32> = Correlator::new();
        let agent = AgentId::from_bytes([1u8; 32]);
        let (_, rx1) = correlator.begin((agent, RequestId::from_bytes([1u8; 32])));
        let (_, rx2) = correlator.begin((agent, RequestId::from_bytes([2u8; 32])));
        correlator.clear_agent(agent, ProxyError::InnerCommunication("lost".into()));
        assert!(await_settled(rx1).await.is_err());
        assert!(await_settled(rx2).await.is_err());
    }
}
