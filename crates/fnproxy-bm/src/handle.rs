//! The public API surface for the Bundle Manager, and its `BundleSync`
//! implementation against the `Deferred` slot FAM exposes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fnproxy_core::{AgentId, BundleId, NodeId, ProxyConfig, ProxyError, RequestId, Result, UnitStatus};
use fnproxy_fam::BundleSync;
use fnproxy_meta::{CoalescingPersister, MetaStore};
use fnproxy_resource::ResourceViewHandle;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{Actor, Command};
use crate::scheduler_client::SchedulerClient;
use crate::types::{GroupResponse, ScheduleRequest, ScheduleResponse};

const COMMAND_QUEUE_DEPTH: usize = 1024;

/// A cheap-to-clone handle to a running BM actor.
///
/// Every clone addresses the same actor; all mutation serializes through its
/// mailbox exactly as the concurrency model requires.
#[derive(Clone)]
pub struct BmHandle {
    tx: mpsc::Sender<Command>,
}

impl BmHandle {
    /// Spawn a fresh BM actor backed by `store` and return a handle to it.
    #[must_use]
    pub fn spawn<M: MetaStore + 'static>(
        node_id: NodeId,
        config: Arc<ProxyConfig>,
        store: Arc<M>,
        resource_view: ResourceViewHandle,
        scheduler: Arc<dyn SchedulerClient>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let actor = Actor {
            node_id,
            config,
            store,
            resource_view,
            scheduler,
            persister: Arc::new(CoalescingPersister::new()),
            bundles: HashMap::new(),
            reservations: HashMap::new(),
            group_counters: HashMap::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        Self { tx }
    }

    /// Reserve resources for one instance within a resource group.
    pub async fn reserve(&self, resource_group_name: String, req: ScheduleRequest) -> ScheduleResponse {
        self.call_infallible(|reply| Command::Reserve(resource_group_name, req, reply)).await
    }

    /// Cancel a reservation that has not yet been bound.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] if no live reservation matches `request_id`.
    pub async fn unreserve(&self, request_id: RequestId) -> Result<()> {
        self.call(|reply| Command::Unreserve(request_id, reply)).await
    }

    /// Promote a reservation to a persisted, bound bundle.
    pub async fn bind(&self, request_id: RequestId) -> GroupResponse {
        self.call_infallible(|reply| Command::Bind(request_id, reply)).await
    }

    /// Release a bound bundle's resources back to its owning agent.
    pub async fn unbind(&self, bundle_id: BundleId) -> GroupResponse {
        self.call_infallible(|reply| Command::Unbind(bundle_id, reply)).await
    }

    /// Delete a bundle outright, e.g. because its owning resource group was destroyed.
    ///
    /// # Errors
    ///
    /// Only fails if persisting the removal fails; an unknown `bundle_id` is a no-op success.
    pub async fn remove_bundle(&self, bundle_id: BundleId) -> Result<()> {
        self.call(|reply| Command::RemoveBundle(bundle_id, reply)).await
    }

    async fn call<T>(&self, make_cmd: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| ProxyError::InnerCommunication("BM actor unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| ProxyError::InnerCommunication("BM actor dropped reply".into()))?
    }

    async fn call_infallible<T: Default>(&self, make_cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(make_cmd(reply_tx)).await.is_err() {
            return T::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

#[async_trait]
impl BundleSync for BmHandle {
    async fn sync_bundles(&self, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Command::SyncBundles(agent_id, reply)).await
    }

    async fn notify_failed_agent(&self, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Command::NotifyFailedAgent(agent_id, reply)).await
    }

    async fn update_bundles_status(&self, agent_id: AgentId, status: UnitStatus) -> Result<()> {
        self.call(|reply| Command::UpdateBundlesStatus(agent_id, status, reply)).await
    }
}

impl BmHandle {
    /// Reconcile this node's bundles against the authoritative agent liveness map,
    /// deleting any bundle whose owning agent is missing or not alive.
    ///
    /// # Errors
    ///
    /// Only fails if persisting a resulting removal fails.
    pub async fn sync_failed_bundles(&self, agent_map: HashMap<AgentId, bool>) -> Result<()> {
        self.call(|reply| Command::SyncFailedBundles(agent_map, reply)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler_client::NoopSchedulerClient;
    use fnproxy_core::{InstanceId, ResourceUnit};
    use fnproxy_meta::InMemoryMetaStore;
    use std::collections::HashMap as Map;

    fn schedule_request(agent_id: AgentId, group: &str) -> ScheduleRequest {
        let mut labels = Map::new();
        labels.insert("agent_id".to_string(), agent_id.to_hex());
        ScheduleRequest {
            request_id: RequestId::generate(),
            instance_id: InstanceId::generate(),
            resource_spec: Map::from([("CPU".to_string(), 1.0)]),
            labels,
            resource_group_ref: group.to_string(),
            affinity: None,
            priority: 0,
            trace_id: "t1".into(),
        }
    }

    async fn spawn_test_bm(resource_view: ResourceViewHandle) -> BmHandle {
        let store = Arc::new(InMemoryMetaStore::new());
        BmHandle::spawn(NodeId::generate(), Arc::new(ProxyConfig::default()), store, resource_view, Arc::new(NoopSchedulerClient))
    }

    #[tokio::test]
    async fn reserve_then_bind_persists_bundle() {
        let resource_view = ResourceViewHandle::spawn();
        let agent_id = AgentId::generate("127.0.0.1:5001", &fnproxy_core::RuntimeMgrId::generate());
        resource_view.add_unit(ResourceUnit::new(agent_id.to_hex(), Map::from([("CPU".to_string(), 10.0)]))).await.unwrap();

        let bm = spawn_test_bm(resource_view).await;
        let req = schedule_request(agent_id, "group-a");
        let request_id = req.request_id;
        let resp = bm.reserve("group-a".to_string(), req).await;
        assert!(resp.success);

        let bound = bm.bind(request_id).await;
        assert!(bound.success);
    }

    #[tokio::test]
    async fn reserve_rejects_duplicate_request_id() {
        let resource_view = ResourceViewHandle::spawn();
        let agent_id = AgentId::generate("127.0.0.1:5001", &fnproxy_core::RuntimeMgrId::generate());
        resource_view.add_unit(ResourceUnit::new(agent_id.to_hex(), Map::from([("CPU".to_string(), 10.0)]))).await.unwrap();

        let bm = spawn_test_bm(resource_view).await;
        let req = schedule_request(agent_id, "group-a");
        let req_clone = ScheduleRequest { request_id: req.request_id, ..schedule_request(agent_id, "group-a") };
        bm.reserve("group-a".to_string(), req).await;
        let resp = bm.reserve("group-a".to_string(), req_clone).await;
        assert!(!resp.success);
        assert_eq!(resp.message, "duplicate request_id");
    }

    #[tokio::test]
    async fn bind_unknown_request_is_not_found() {
        let resource_view = ResourceViewHandle::spawn();
        let bm = spawn_test_bm(resource_view).await;
        let resp = bm.bind(RequestId::generate()).await;
        assert!(!resp.success);
        assert_eq!(resp.message, "not found");
    }

    #[tokio::test]
    async fn notify_failed_agent_marks_bundles_to_be_delete() {
        let resource_view = ResourceViewHandle::spawn();
        let agent_id = AgentId::generate("127.0.0.1:5001", &fnproxy_core::RuntimeMgrId::generate());
        resource_view.add_unit(ResourceUnit::new(agent_id.to_hex(), Map::from([("CPU".to_string(), 10.0)]))).await.unwrap();

        let bm = spawn_test_bm(resource_view).await;
        let req = schedule_request(agent_id, "group-a");
        let request_id = req.request_id;
        bm.reserve("group-a".to_string(), req).await;
        bm.bind(request_id).await;

        BundleSync::notify_failed_agent(&bm, agent_id).await.unwrap();
    }
}
