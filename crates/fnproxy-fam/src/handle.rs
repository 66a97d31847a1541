//! The public API surface for the Function-Agent Manager.

use std::collections::HashMap;
use std::sync::Arc;

use fnproxy_core::{
    AgentId, Deferred, InstanceId, NodeId, ProxyConfig, ProxyError, Result, ResourceUnit, RuntimeMgrId,
};
use fnproxy_heartbeat::HeartbeatHandle;
use fnproxy_meta::{CoalescingPersister, MetaStore};
use fnproxy_resource::ResourceViewHandle;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::actor::{Actor, Command};
use crate::agent_client::{AgentClient, DeployInstanceRequest, DeployInstanceResponse, InstanceStatusInfo, KillInstanceRequest, KillInstanceResponse, UpdateCredResponse};
use crate::hooks::{BundleSync, InstanceSync};
use crate::tenant::{NoopTenantAffinityPolicy, TenantAffinityPolicy, TenantInstanceEvent};
use crate::types::{
    AgentExitStatus, AgentRegistration, EvictAgentRequest, EvictResult, LocalStatus, RegisterRequest,
    RegisteredResponse,
};

const COMMAND_QUEUE_DEPTH: usize = 1024;
const EVICT_RESULT_QUEUE_DEPTH: usize = 256;

/// A cheap-to-clone handle to a running FAM actor.
///
/// Every clone addresses the same actor; all mutation serializes through its
/// mailbox exactly as the concurrency model requires.
#[derive(Clone)]
pub struct FamHandle {
    tx: mpsc::Sender<Command>,
    instance_sync: Arc<Deferred<dyn InstanceSync>>,
    bundle_sync: Arc<Deferred<dyn BundleSync>>,
    evict_results: broadcast::Sender<EvictResult>,
}

impl FamHandle {
    /// Spawn a fresh FAM actor backed by `store` and return a handle to it.
    ///
    /// The returned handle exposes unbound [`Deferred`] slots for the IC/BM
    /// callback traits; whoever wires the system together must `bind` both
    /// before routing any traffic, or registration/eviction/heartbeat-loss
    /// handling will silently skip those steps.
    #[must_use]
    pub fn spawn<M: MetaStore + 'static>(
        node_id: NodeId,
        config: Arc<ProxyConfig>,
        store: Arc<M>,
        resource_view: ResourceViewHandle,
        heartbeat: Arc<dyn HeartbeatHandle>,
        agent_client: Arc<dyn AgentClient>,
    ) -> Self {
        Self::spawn_with_tenant_policy(
            node_id,
            config,
            store,
            resource_view,
            heartbeat,
            agent_client,
            Arc::new(NoopTenantAffinityPolicy),
        )
    }

    /// As [`Self::spawn`], but with an explicit tenant-affinity policy instead of the no-op default.
    #[must_use]
    pub fn spawn_with_tenant_policy<M: MetaStore + 'static>(
        node_id: NodeId,
        config: Arc<ProxyConfig>,
        store: Arc<M>,
        resource_view: ResourceViewHandle,
        heartbeat: Arc<dyn HeartbeatHandle>,
        agent_client: Arc<dyn AgentClient>,
        tenant_policy: Arc<dyn TenantAffinityPolicy>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (evict_results, _) = broadcast::channel(EVICT_RESULT_QUEUE_DEPTH);
        let instance_sync: Arc<Deferred<dyn InstanceSync>> = Arc::new(Deferred::new());
        let bundle_sync: Arc<Deferred<dyn BundleSync>> = Arc::new(Deferred::new());

        let actor = Actor {
            node_id,
            config,
            store,
            resource_view,
            heartbeat,
            agent_client,
            instance_sync: Arc::clone(&instance_sync),
            bundle_sync: Arc::clone(&bundle_sync),
            tenant_policy,
            tenant_cache: crate::tenant::TenantAffinityCache::new(),
            persister: Arc::new(CoalescingPersister::new()),
            agents: HashMap::new(),
            address_index: HashMap::new(),
            runtime: HashMap::new(),
            monopoly_agents: std::collections::HashSet::new(),
            local_status: LocalStatus::Normal,
            abnormal: false,
            deploy_correlator: crate::correlator::Correlator::new(),
            kill_correlator: crate::correlator::Correlator::new(),
            evict_results: evict_results.clone(),
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        Self { tx, instance_sync, bundle_sync, evict_results }
    }

    /// The slot IC binds its handle into, so FAM can call back for instance
    /// sync/fail/evict during registration, recovery, and heartbeat loss.
    #[must_use]
    pub fn instance_sync_slot(&self) -> Arc<Deferred<dyn InstanceSync>> {
        Arc::clone(&self.instance_sync)
    }

    /// The slot BM binds its handle into, so FAM can call back for bundle
    /// sync/fail/status-propagation during registration, recovery, and heartbeat loss.
    #[must_use]
    pub fn bundle_sync_slot(&self) -> Arc<Deferred<dyn BundleSync>> {
        Arc::clone(&self.bundle_sync)
    }

    /// Subscribe to every eviction's eventual outcome, mirroring the
    /// `NotifyEvictResult` upstream message. An eviction started before a
    /// given subscription will never be observed on it.
    #[must_use]
    pub fn subscribe_evict_results(&self) -> broadcast::Receiver<EvictResult> {
        self.evict_results.subscribe()
    }

    /// Register a new agent, or idempotently acknowledge an already-registered one.
    pub async fn register(&self, req: RegisterRequest) -> RegisteredResponse {
        self.call_infallible(|reply| Command::Register(req, reply)).await
    }

    /// Push a fresh capacity/usage report for an agent into the resource view.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource view rejects the update.
    pub async fn update_resources(&self, agent_id: AgentId, unit: ResourceUnit) -> Result<()> {
        self.call(|reply| Command::UpdateResources(agent_id, unit, reply)).await
    }

    /// Route an agent-reported instance status update to IC and echo the result back.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown or IC rejects the update.
    pub async fn update_instance_status(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        status: serde_json::Value,
    ) -> Result<()> {
        self.call(|reply| Command::UpdateInstanceStatus(agent_id, instance_id, status, reply)).await
    }

    /// Route an agent-reported exit/register-failure status into cleanup:
    /// reschedule the agent's instances, clear its tenant-affinity tracking,
    /// and best-effort send it a `CleanStatus` RPC.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown.
    pub async fn update_agent_status(&self, agent_id: AgentId, status: AgentExitStatus) -> Result<()> {
        self.call(|reply| Command::UpdateAgentStatus(agent_id, status, reply)).await
    }

    /// Deploy an instance onto an agent, deduplicating by `request_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown, disabled, or the RPC exhausts its retry budget.
    pub async fn deploy_instance(
        &self,
        agent_id: AgentId,
        req: DeployInstanceRequest,
    ) -> Result<DeployInstanceResponse> {
        self.call(|reply| Command::DeployInstance(agent_id, req, reply)).await
    }

    /// Kill an instance on an agent, deduplicating by `request_id`.
    ///
    /// `is_recovering` allows a forced kill against a not-yet-enabled agent, used while
    /// replaying state after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown or the RPC exhausts its retry budget.
    pub async fn kill_instance(
        &self,
        agent_id: AgentId,
        req: KillInstanceRequest,
        is_recovering: bool,
    ) -> Result<KillInstanceResponse> {
        self.call(|reply| Command::KillInstance(agent_id, req, is_recovering, reply)).await
    }

    /// Query an instance's status directly from its agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown or unreachable.
    pub async fn query_instance_status(
        &self,
        agent_id: AgentId,
        instance_id: InstanceId,
        runtime_mgr_id: RuntimeMgrId,
    ) -> Result<InstanceStatusInfo> {
        self.call(|reply| Command::QueryInstanceStatus(agent_id, instance_id, runtime_mgr_id, reply)).await
    }

    /// Push an updated credential to an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown or unreachable.
    pub async fn update_cred(&self, agent_id: AgentId, token: String) -> Result<UpdateCredResponse> {
        self.call(|reply| Command::UpdateCred(agent_id, token, reply)).await
    }

    /// Begin evicting an agent. Returns once the 3-phase protocol has been
    /// kicked off; the eventual outcome arrives via [`Self::subscribe_evict_results`].
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is unknown or persisting the `Evicting` transition fails.
    pub async fn evict_agent(&self, req: EvictAgentRequest) -> Result<()> {
        self.call(|reply| Command::EvictAgent(req, reply)).await
    }

    /// Set this node's local scheduler status.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the new status fails.
    pub async fn set_local_status(&self, status: LocalStatus) -> Result<()> {
        self.call(|reply| Command::SetLocalStatus(status, reply)).await
    }

    /// Evict every registered agent and mark this node as no longer accepting traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the final persisted-state cleanup fails.
    pub async fn graceful_shutdown(&self) -> Result<()> {
        self.call(|reply| Command::GracefulShutdown(reply)).await
    }

    /// Record a tenant instance placement in the advisory affinity cache.
    pub async fn tenant_update_instance(&self, event: TenantInstanceEvent) {
        let _ = self.tx.send(Command::TenantUpdateInstance(event)).await;
    }

    /// Record a tenant instance removal in the advisory affinity cache.
    pub async fn tenant_delete_instance(&self, event: TenantInstanceEvent) {
        let _ = self.tx.send(Command::TenantDeleteInstance(event)).await;
    }

    /// Load this node's persisted agent map, discarding any in-memory state.
    ///
    /// # Errors
    ///
    /// Only fails if the actor itself is gone; a missing or corrupt persisted blob
    /// is treated as an empty starting state.
    pub async fn sync(&self) -> Result<()> {
        self.call(|reply| Command::Sync(reply)).await
    }

    /// Load persisted state and replay per-agent recovery (heartbeats, IC/BM sync,
    /// in-flight eviction reconciliation). Intended to run once at process start.
    ///
    /// # Errors
    ///
    /// Only fails if the actor itself is gone.
    pub async fn recover(&self) -> Result<()> {
        self.call(|reply| Command::Recover(reply)).await
    }

    /// Snapshot every known agent's registration record.
    pub async fn query_agent_info(&self) -> Vec<AgentRegistration> {
        self.call_infallible(|reply| Command::QueryAgentInfo(reply)).await
    }

    /// Fan out a debug-instance query across every registered agent and persist the merged result.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the merged result fails.
    pub async fn query_debug_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.call(|reply| Command::QueryDebugInstance(instance_id, reply)).await
    }

    async fn call<T>(&self, make_cmd: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| ProxyError::InnerCommunication("FAM actor unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| ProxyError::InnerCommunication("FAM actor dropped reply".into()))?
    }

    async fn call_infallible<T: Default>(&self, make_cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(make_cmd(reply_tx)).await.is_err() {
            return T::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fnproxy_core::RequestId;
    use fnproxy_heartbeat::{HeartbeatConfig, HeartbeatController, Prober};
    use fnproxy_meta::InMemoryMetaStore;
    use crate::agent_client::ClientResult;
    use crate::types::{AgentStatus, RegisterOutcome};
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct AlwaysUpProber;

    #[async_trait]
    impl Prober for AlwaysUpProber {
        async fn probe(&self, _address: &str) -> bool {
            true
        }
    }

    struct EchoAgentClient;

    #[async_trait]
    impl AgentClient for EchoAgentClient {
        async fn deploy_instance(
            &self,
            _address: &str,
            req: &DeployInstanceRequest,
            _timeout: Duration,
        ) -> ClientResult<DeployInstanceResponse> {
            let _ = req;
            Ok(DeployInstanceResponse { success: true, message: "deployed".into() })
        }

        async fn kill_instance(
            &self,
            _address: &str,
            _req: &KillInstanceRequest,
            _timeout: Duration,
        ) -> ClientResult<KillInstanceResponse> {
            Ok(KillInstanceResponse { success: true, message: "killed".into() })
        }

        async fn query_instance_status(
            &self,
            _address: &str,
            instance_id: InstanceId,
            _runtime_mgr_id: RuntimeMgrId,
            _timeout: Duration,
        ) -> ClientResult<InstanceStatusInfo> {
            Ok(InstanceStatusInfo { instance_id, status: serde_json::json!({"phase": "running"}) })
        }

        async fn update_cred(&self, _address: &str, _token: &str, _timeout: Duration) -> ClientResult<UpdateCredResponse> {
            Ok(UpdateCredResponse { success: true })
        }

        async fn clean_status(&self, _address: &str, _timeout: Duration) -> ClientResult<crate::agent_client::CleanStatusResponse> {
            Ok(crate::agent_client::CleanStatusResponse { acknowledged: true })
        }

        async fn query_debug_instance_info(
            &self,
            _address: &str,
            _instance_id: InstanceId,
            _timeout: Duration,
        ) -> ClientResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    struct NoopInstanceSync;

    #[async_trait]
    impl InstanceSync for NoopInstanceSync {
        async fn sync_instances(&self, _agent_id: AgentId) -> Result<()> {
            Ok(())
        }
        async fn put_failed_instance_status_by_agent_id(&self, _agent_id: AgentId) -> Result<()> {
            Ok(())
        }
        async fn update_instance_status(&self, _instance_id: InstanceId, _status: serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn evict_instance_on_agent(&self, _agent_id: AgentId, _timeout_sec: u64) -> Result<()> {
            Ok(())
        }
    }

    struct NoopBundleSync;

    #[async_trait]
    impl BundleSync for NoopBundleSync {
        async fn sync_bundles(&self, _agent_id: AgentId) -> Result<()> {
            Ok(())
        }
        async fn notify_failed_agent(&self, _agent_id: AgentId) -> Result<()> {
            Ok(())
        }
        async fn update_bundles_status(&self, _agent_id: AgentId, _status: fnproxy_core::UnitStatus) -> Result<()> {
            Ok(())
        }
    }

    fn spawn_test_fam() -> FamHandle {
        let store = Arc::new(InMemoryMetaStore::new());
        let resource_view = ResourceViewHandle::spawn();
        let controller = HeartbeatController::new(AlwaysUpProber, HeartbeatConfig::default());
        let heartbeat: Arc<dyn HeartbeatHandle> = Arc::new(controller);
        FamHandle::spawn(
            NodeId::generate(),
            Arc::new(ProxyConfig::default()),
            store,
            resource_view,
            heartbeat,
            Arc::new(EchoAgentClient),
        )
    }

    fn registration(agent_id: AgentId) -> RegisterRequest {
        RegisterRequest {
            agent_id,
            agent_address: "127.0.0.1:9000".into(),
            runtime_mgr_id: RuntimeMgrId::generate(),
            initial_unit: ResourceUnit::new(agent_id.to_hex(), Map::from([("CPU".to_string(), 4.0)])),
        }
    }

    #[tokio::test]
    async fn register_then_deploy_succeeds() {
        let fam = spawn_test_fam();
        fam.instance_sync_slot().bind(Arc::new(NoopInstanceSync)).await;
        fam.bundle_sync_slot().bind(Arc::new(NoopBundleSync)).await;

        let agent_id = AgentId::generate("127.0.0.1:9000", &RuntimeMgrId::generate());
        let resp = fam.register(registration(agent_id)).await;
        assert_eq!(resp.outcome, RegisterOutcome::Success);

        let deployed = fam
            .deploy_instance(
                agent_id,
                DeployInstanceRequest {
                    request_id: RequestId::generate(),
                    instance_id: InstanceId::generate(),
                    spec: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        assert!(deployed.success);
    }

    #[tokio::test]
    async fn register_rejects_empty_address() {
        let fam = spawn_test_fam();
        let req = RegisterRequest { agent_address: String::new(), ..registration(AgentId::generate("x", &RuntimeMgrId::generate())) };
        let resp = fam.register(req).await;
        assert_eq!(resp.outcome, RegisterOutcome::ParameterError);
    }

    #[tokio::test]
    async fn deploy_against_unknown_agent_is_not_found() {
        let fam = spawn_test_fam();
        let err = fam
            .deploy_instance(
                AgentId::generate("ghost", &RuntimeMgrId::generate()),
                DeployInstanceRequest {
                    request_id: RequestId::generate(),
                    instance_id: InstanceId::generate(),
                    spec: serde_json::json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn evict_agent_settles_via_broadcast() {
        let fam = spawn_test_fam();
        fam.instance_sync_slot().bind(Arc::new(NoopInstanceSync)).await;
        fam.bundle_sync_slot().bind(Arc::new(NoopBundleSync)).await;

        let agent_id = AgentId::generate("127.0.0.1:9000", &RuntimeMgrId::generate());
        fam.register(registration(agent_id)).await;

        let mut results = fam.subscribe_evict_results();
        fam.evict_agent(EvictAgentRequest { agent_id, timeout_sec: 5 }).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), results.recv()).await.unwrap().unwrap();
        assert!(result.success);

        let seen_evicted = Arc::new(AtomicBool::new(false));
        for reg in fam.query_agent_info().await {
            if reg.agent_id == agent_id {
                seen_evicted.store(reg.status == AgentStatus::Evicted, Ordering::SeqCst);
            }
        }
        assert!(seen_evicted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn monopoly_kill_success_disconnects_agent() {
        let fam = spawn_test_fam();
        fam.instance_sync_slot().bind(Arc::new(NoopInstanceSync)).await;
        fam.bundle_sync_slot().bind(Arc::new(NoopBundleSync)).await;

        let agent_id = AgentId::generate("127.0.0.1:9000", &RuntimeMgrId::generate());
        fam.register(registration(agent_id)).await;

        let resp = fam
            .kill_instance(
                agent_id,
                KillInstanceRequest {
                    request_id: RequestId::generate(),
                    instance_id: InstanceId::generate(),
                    force: false,
                    is_monopoly: true,
                },
                false,
            )
            .await
            .unwrap();
        assert!(resp.success);

        // instance_killed's async disconnect runs off the back of the reply; give it a tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fam.query_agent_info().await.into_iter().all(|r| r.agent_id != agent_id));
    }

    #[tokio::test]
    async fn update_agent_status_on_exit_cleans_up() {
        let fam = spawn_test_fam();
        fam.instance_sync_slot().bind(Arc::new(NoopInstanceSync)).await;
        fam.bundle_sync_slot().bind(Arc::new(NoopBundleSync)).await;

        let agent_id = AgentId::generate("127.0.0.1:9000", &RuntimeMgrId::generate());
        fam.register(registration(agent_id)).await;

        fam.update_agent_status(agent_id, AgentExitStatus::FuncAgentExited).await.unwrap();

        let reg = fam.query_agent_info().await.into_iter().find(|r| r.agent_id == agent_id).unwrap();
        assert_eq!(reg.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn update_agent_status_against_unknown_agent_is_not_found() {
        let fam = spawn_test_fam();
        let err = fam
            .update_agent_status(
                AgentId::generate("ghost", &RuntimeMgrId::generate()),
                AgentExitStatus::RuntimeManagerRegisterFailed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
