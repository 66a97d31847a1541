//! The FAM actor: single-threaded, message-dispatched, owning every agent on
//! this node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fnproxy_core::{
    AgentId, Deferred, InstanceId, NodeId, ProxyConfig, ProxyError, Result, ResourceUnit, RequestId, RuntimeMgrId,
    UnitStatus,
};
use fnproxy_heartbeat::HeartbeatHandle;
use fnproxy_meta::{CoalescingPersister, MetaStore};
use fnproxy_resource::ResourceViewHandle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::agent_client::{
    AgentClient, DeployInstanceRequest, DeployInstanceResponse, InstanceStatusInfo, KillInstanceRequest,
    KillInstanceResponse, UpdateCredResponse,
};
use crate::correlator::{await_settled, Correlator};
use crate::hooks::{BundleSync, InstanceSync};
use crate::tenant::{TenantAffinityCache, TenantAffinityPolicy, TenantInstanceEvent};
use crate::types::{
    AgentExitStatus, AgentInfoBlob, AgentRegistration, AgentRuntimeState, AgentStatus, EvictAgentRequest, EvictResult,
    LocalStatus, RegisterOutcome, RegisterRequest, RegisteredResponse,
};

fn agent_info_key(node_id: &NodeId) -> Vec<u8> {
    format!("/yr/agentInfo/{node_id}").into_bytes()
}

fn debug_key(instance_id: &InstanceId) -> Vec<u8> {
    format!("/yr/debug/{instance_id}").into_bytes()
}

type CorrelatorKey = (AgentId, RequestId);

pub(crate) enum Command {
    Register(RegisterRequest, oneshot::Sender<RegisteredResponse>),
    UpdateResources(AgentId, ResourceUnit, oneshot::Sender<Result<()>>),
    UpdateInstanceStatus(AgentId, InstanceId, serde_json::Value, oneshot::Sender<Result<()>>),
    UpdateAgentStatus(AgentId, AgentExitStatus, oneshot::Sender<Result<()>>),
    DeployInstance(AgentId, DeployInstanceRequest, oneshot::Sender<Result<DeployInstanceResponse>>),
    KillInstance(AgentId, KillInstanceRequest, bool, oneshot::Sender<Result<KillInstanceResponse>>),
    QueryInstanceStatus(AgentId, InstanceId, RuntimeMgrId, oneshot::Sender<Result<InstanceStatusInfo>>),
    UpdateCred(AgentId, String, oneshot::Sender<Result<UpdateCredResponse>>),
    EvictAgent(EvictAgentRequest, oneshot::Sender<Result<()>>),
    SetLocalStatus(LocalStatus, oneshot::Sender<Result<()>>),
    GracefulShutdown(oneshot::Sender<Result<()>>),
    TenantUpdateInstance(TenantInstanceEvent),
    TenantDeleteInstance(TenantInstanceEvent),
    TimeoutEvent(AgentId),
    Sync(oneshot::Sender<Result<()>>),
    Recover(oneshot::Sender<Result<()>>),
    QueryAgentInfo(oneshot::Sender<Vec<AgentRegistration>>),
    QueryDebugInstance(InstanceId, oneshot::Sender<Result<()>>),
    SettleDeploy(CorrelatorKey, Result<DeployInstanceResponse>),
    SettleKill(CorrelatorKey, Result<KillInstanceResponse>),
    InstanceKilled(AgentId, InstanceId),
    GcFailedAgent(AgentId),
    EvictOnAgentCompleted(AgentId, bool, String),
}

pub(crate) struct Actor<M: MetaStore> {
    pub(crate) node_id: NodeId,
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) store: Arc<M>,
    pub(crate) resource_view: ResourceViewHandle,
    pub(crate) heartbeat: Arc<dyn HeartbeatHandle>,
    pub(crate) agent_client: Arc<dyn AgentClient>,
    pub(crate) instance_sync: Arc<Deferred<dyn InstanceSync>>,
    pub(crate) bundle_sync: Arc<Deferred<dyn BundleSync>>,
    pub(crate) tenant_policy: Arc<dyn TenantAffinityPolicy>,
    pub(crate) tenant_cache: TenantAffinityCache,
    pub(crate) persister: Arc<CoalescingPersister>,
    pub(crate) agents: HashMap<AgentId, AgentRegistration>,
    pub(crate) address_index: HashMap<String, AgentId>,
    pub(crate) runtime: HashMap<AgentId, AgentRuntimeState>,
    /// Agents currently holding an in-flight monopoly (exclusive-agent) kill;
    /// a successful kill against a member disconnects the agent entirely.
    pub(crate) monopoly_agents: HashSet<AgentId>,
    pub(crate) local_status: LocalStatus,
    pub(crate) abnormal: bool,
    pub(crate) deploy_correlator: Correlator<DeployInstanceResponse>,
    pub(crate) kill_correlator: Correlator<KillInstanceResponse>,
    pub(crate) evict_results: broadcast::Sender<EvictResult>,
    pub(crate) self_tx: mpsc::Sender<Command>,
}

impl<M: MetaStore + 'static> Actor<M> {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.dispatch(cmd).await;
        }
        info!(node_id = %self.node_id, "FAM actor shutting down: no more handles");
    }

    async fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Register(req, reply) => {
                let resp = self.register(req).await;
                let _ = reply.send(resp);
            }
            Command::UpdateResources(agent_id, unit, reply) => {
                let _ = reply.send(self.update_resources(agent_id, unit).await);
            }
            Command::UpdateInstanceStatus(agent_id, instance_id, status, reply) => {
                let _ = reply.send(self.update_instance_status(agent_id, instance_id, status).await);
            }
            Command::UpdateAgentStatus(agent_id, status, reply) => {
                let _ = reply.send(self.update_agent_status(agent_id, status).await);
            }
            Command::DeployInstance(agent_id, req, reply) => {
                self.deploy_instance(agent_id, req, reply);
            }
            Command::KillInstance(agent_id, req, is_recovering, reply) => {
                self.kill_instance(agent_id, req, is_recovering, reply).await;
            }
            Command::QueryInstanceStatus(agent_id, instance_id, rm_id, reply) => {
                let _ = reply.send(self.query_instance_status(agent_id, instance_id, rm_id).await);
            }
            Command::UpdateCred(agent_id, token, reply) => {
                let _ = reply.send(self.update_cred(agent_id, token).await);
            }
            Command::EvictAgent(req, reply) => {
                let _ = reply.send(self.evict_agent(req).await);
            }
            Command::SetLocalStatus(status, reply) => {
                let _ = reply.send(self.set_local_status(status).await);
            }
            Command::GracefulShutdown(reply) => {
                let _ = reply.send(self.graceful_shutdown().await);
            }
            Command::TenantUpdateInstance(event) => {
                if self.config.enable_tenant_affinity {
                    self.tenant_cache.update_instance(event, self.tenant_policy.as_ref()).await;
                }
            }
            Command::TenantDeleteInstance(event) => {
                if self.config.enable_tenant_affinity {
                    self.tenant_cache
                        .delete_instance(event, self.tenant_policy.as_ref(), self.config.tenant_pod_reuse_time_window_sec)
                        .await;
                }
            }
            Command::TimeoutEvent(agent_id) => {
                self.timeout_event(agent_id).await;
            }
            Command::Sync(reply) => {
                let _ = reply.send(self.sync().await);
            }
            Command::Recover(reply) => {
                let _ = reply.send(self.recover().await);
            }
            Command::QueryAgentInfo(reply) => {
                let _ = reply.send(self.agents.values().cloned().collect());
            }
            Command::QueryDebugInstance(instance_id, reply) => {
                let _ = reply.send(self.query_debug_instance(instance_id).await);
            }
            Command::SettleDeploy(key, result) => {
                self.deploy_correlator.settle(key, result);
            }
            Command::SettleKill(key, result) => {
                self.kill_correlator.settle(key, result);
            }
            Command::InstanceKilled(agent_id, instance_id) => {
                self.instance_killed(agent_id, instance_id).await;
            }
            Command::GcFailedAgent(agent_id) => {
                self.gc_failed_agent(agent_id).await;
            }
            Command::EvictOnAgentCompleted(agent_id, success, message) => {
                self.on_evict_instance_phase_complete(agent_id, success, message).await;
            }
        }
    }

    fn snapshot_blob(&self) -> AgentInfoBlob {
        AgentInfoBlob { agents: self.agents.clone(), local_status: self.local_status }
    }

    async fn persist_agent_info(&self) -> Result<()> {
        if self.abnormal {
            return Err(ProxyError::LocalSchedulerAbnormal);
        }
        let store = Arc::clone(&self.store);
        let key = agent_info_key(&self.node_id);
        let blob = self.snapshot_blob();
        self.persister
            .persist(store, key, move || serde_json::to_vec(&blob).unwrap_or_default())
            .await
            .map_err(ProxyError::from)
    }

    async fn register(&mut self, req: RegisterRequest) -> RegisteredResponse {
        if req.agent_address.is_empty() {
            return RegisteredResponse {
                outcome: RegisterOutcome::ParameterError,
                message: "agent_address must not be empty".into(),
            };
        }

        if let Some(existing) = self.agents.get(&req.agent_id) {
            match existing.status {
                AgentStatus::Evicted => {
                    return RegisteredResponse {
                        outcome: RegisterOutcome::AgentEvicted,
                        message: "agent was evicted; operator action required".into(),
                    };
                }
                AgentStatus::Failed => {
                    return RegisteredResponse {
                        outcome: RegisterOutcome::Failed,
                        message: "agent previously failed; caller must clean up before retrying".into(),
                    };
                }
                AgentStatus::Success | AgentStatus::Evicting => {
                    return RegisteredResponse {
                        outcome: RegisterOutcome::Success,
                        message: format!("{} already registered", req.agent_id),
                    };
                }
            }
        }

        self.agents.insert(
            req.agent_id,
            AgentRegistration {
                agent_id: req.agent_id,
                agent_address: req.agent_address.clone(),
                runtime_mgr_id: req.runtime_mgr_id,
                status: AgentStatus::Success,
                evict_timeout_sec: None,
            },
        );
        self.address_index.insert(req.agent_address.clone(), req.agent_id);
        self.runtime.insert(req.agent_id, AgentRuntimeState::new());

        if let Err(err) = self.persist_agent_info().await {
            self.teardown_failed_registration(req.agent_id).await;
            return RegisteredResponse {
                outcome: RegisterOutcome::Failed,
                message: format!("failed to persist agent info: {err}"),
            };
        }

        self.install_heartbeat(req.agent_id, req.agent_address.clone());

        if let Err(err) = self.resource_view.add_unit(req.initial_unit).await {
            self.teardown_failed_registration(req.agent_id).await;
            return RegisteredResponse {
                outcome: RegisterOutcome::Failed,
                message: format!("failed to seed resource view: {err}"),
            };
        }
        if let Some(state) = self.runtime.get_mut(&req.agent_id) {
            state.initialized = true;
        }

        if let Some(hook) = self.instance_sync.get().await {
            if let Err(err) = hook.sync_instances(req.agent_id).await {
                warn!(agent_id = %req.agent_id, %err, "instance sync failed during registration");
                self.teardown_failed_registration(req.agent_id).await;
                return RegisteredResponse { outcome: RegisterOutcome::Failed, message: err.to_string() };
            }
        }
        if let Some(hook) = self.bundle_sync.get().await {
            if let Err(err) = hook.sync_bundles(req.agent_id).await {
                warn!(agent_id = %req.agent_id, %err, "bundle sync failed during registration");
                self.teardown_failed_registration(req.agent_id).await;
                return RegisteredResponse { outcome: RegisterOutcome::Failed, message: err.to_string() };
            }
        }

        if let Some(state) = self.runtime.get_mut(&req.agent_id) {
            state.enabled = true;
        }
        info!(agent_id = %req.agent_id, address = %req.agent_address, "agent registered successfully");
        RegisteredResponse {
            outcome: RegisterOutcome::Success,
            message: format!("{} register successfully", req.agent_id),
        }
    }

    async fn teardown_failed_registration(&mut self, agent_id: AgentId) {
        if let Some(reg) = self.agents.remove(&agent_id) {
            self.address_index.remove(&reg.agent_address);
        }
        self.runtime.remove(&agent_id);
        self.heartbeat.delete_peer(&agent_id.to_hex());
        let _ = self.resource_view.delete_unit(agent_id.to_hex()).await;
    }

    fn install_heartbeat(&mut self, agent_id: AgentId, address: String) {
        let tx = self.self_tx.clone();
        let peer_key = agent_id.to_hex();
        self.heartbeat.add_peer(
            peer_key,
            address,
            Box::new(move |_peer_id| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Command::TimeoutEvent(agent_id)).await;
                });
            }),
        );
    }

    async fn update_resources(&mut self, agent_id: AgentId, unit: ResourceUnit) -> Result<()> {
        let Some(reg) = self.agents.get(&agent_id) else { return Ok(()) };
        if reg.status != AgentStatus::Success {
            return Ok(());
        }
        let Some(state) = self.runtime.get_mut(&agent_id) else { return Ok(()) };
        if !state.enabled {
            return Ok(());
        }

        if state.initialized {
            self.resource_view.update_unit(unit, fnproxy_core::UpdateType::Actual).await?;
        } else {
            self.resource_view.add_unit(unit).await?;
            state.initialized = true;
        }
        Ok(())
    }

    async fn update_instance_status(
        &mut self,
        agent_id: AgentId,
        instance_id: InstanceId,
        status: serde_json::Value,
    ) -> Result<()> {
        if !self.agents.contains_key(&agent_id) {
            return Err(ProxyError::NotFound(format!("agent {agent_id}")));
        }
        if let Some(hook) = self.instance_sync.get().await {
            // The concrete status transition is IC's to own; FAM only routes and echoes.
            hook.update_instance_status(instance_id, status).await?;
        }
        if let Some(state) = self.runtime.get_mut(&agent_id) {
            state.instance_ids.insert(instance_id);
        }
        Ok(())
    }

    async fn update_agent_status(&mut self, agent_id: AgentId, status: AgentExitStatus) -> Result<()> {
        if !self.agents.contains_key(&agent_id) {
            return Err(ProxyError::NotFound(format!("agent {agent_id}")));
        }
        match status {
            AgentExitStatus::FuncAgentExited | AgentExitStatus::RuntimeManagerRegisterFailed => {
                self.cleanup_agent_resources(agent_id, self.config.enable_force_delete_pod).await;
            }
        }
        Ok(())
    }

    /// Tear an exited agent down: fail its instances, clear its tenant-affinity
    /// tracking, and best-effort request the agent clean up after itself.
    /// `request_pod_deletion` decides whether this is also logged as a
    /// pod-deletion candidate for the (external) pod scheduler to act on.
    async fn cleanup_agent_resources(&mut self, agent_id: AgentId, request_pod_deletion: bool) {
        let address = self.agents.get(&agent_id).map(|r| r.agent_address.clone());

        self.timeout_event(agent_id).await;

        if self.config.enable_tenant_affinity {
            self.tenant_cache
                .clear_agent(agent_id, self.tenant_policy.as_ref(), self.config.tenant_pod_reuse_time_window_sec)
                .await;
        }

        if request_pod_deletion {
            warn!(%agent_id, "exited agent is a pod-deletion candidate");
        }

        if let Some(address) = address {
            self.spawn_clean_status(address);
        }
    }

    /// Best-effort `CleanStatus` RPC against a just-torn-down agent, retried up
    /// to `max_retry_send_clean_status_times` independently of the deploy/kill
    /// retry budget.
    fn spawn_clean_status(&self, address: String) {
        let client = Arc::clone(&self.agent_client);
        let retry_times = self.config.max_retry_send_clean_status_times;
        let retry_cycle_ms = self.config.retry_cycle_ms;
        tokio::spawn(async move {
            for attempt in 0..=retry_times {
                match client.clean_status(&address, Duration::from_millis(retry_cycle_ms)).await {
                    Ok(resp) if resp.acknowledged => return,
                    _ => {
                        if attempt < retry_times {
                            tokio::time::sleep(Duration::from_millis(retry_cycle_ms)).await;
                        }
                    }
                }
            }
            warn!(%address, "clean-status exchange exhausted retry budget");
        });
    }

    fn deploy_instance(
        &mut self,
        agent_id: AgentId,
        req: DeployInstanceRequest,
        reply: oneshot::Sender<Result<DeployInstanceResponse>>,
    ) {
        let Some(registration) = self.agents.get(&agent_id) else {
            let _ = reply.send(Err(ProxyError::NotFound(format!("agent {agent_id}"))));
            return;
        };
        let enabled = self.runtime.get(&agent_id).is_some_and(|s| s.enabled);
        if !enabled {
            let _ = reply.send(Err(ProxyError::InnerCommunication("agent not enabled".into())));
            return;
        }

        let key = (agent_id, req.request_id);
        let (is_fresh, rx) = self.deploy_correlator.begin(key);
        let address = registration.agent_address.clone();
        if is_fresh {
            let client = Arc::clone(&self.agent_client);
            let tx = self.self_tx.clone();
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let outcome = retry_rpc(config.retry_times, config.retry_cycle_ms, || {
                    let client = Arc::clone(&client);
                    let address = address.clone();
                    let req = req.clone();
                    let retry_cycle_ms = config.retry_cycle_ms;
                    async move { client.deploy_instance(&address, &req, Duration::from_millis(retry_cycle_ms)).await }
                })
                .await;
                let result = outcome.map_err(ProxyError::InnerCommunication);
                let _ = tx.send(Command::SettleDeploy(key, result)).await;
            });
        }
        tokio::spawn(async move {
            let _ = reply.send(await_settled(rx).await);
        });
    }

    async fn kill_instance(
        &mut self,
        agent_id: AgentId,
        req: KillInstanceRequest,
        is_recovering: bool,
        reply: oneshot::Sender<Result<KillInstanceResponse>>,
    ) {
        let Some(registration) = self.agents.get(&agent_id) else {
            let _ = reply.send(Err(ProxyError::NotFound(format!("agent {agent_id}"))));
            return;
        };
        let enabled = self.runtime.get(&agent_id).is_some_and(|s| s.enabled);
        if !enabled && !is_recovering {
            if let Some(state) = self.runtime.get_mut(&agent_id) {
                state.instance_ids.remove(&req.instance_id);
            }
            let _ = reply.send(Ok(KillInstanceResponse {
                success: true,
                message: "function agent may already exited".into(),
            }));
            return;
        }

        let instance_id = req.instance_id;
        if req.is_monopoly {
            self.monopoly_agents.insert(agent_id);
        }

        let key = (agent_id, req.request_id);
        let (is_fresh, rx) = self.kill_correlator.begin(key);
        let address = registration.agent_address.clone();
        if is_fresh {
            let client = Arc::clone(&self.agent_client);
            let tx = self.self_tx.clone();
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let outcome = retry_rpc(config.retry_times, config.retry_cycle_ms, || {
                    let client = Arc::clone(&client);
                    let address = address.clone();
                    let req = req.clone();
                    let retry_cycle_ms = config.retry_cycle_ms;
                    async move { client.kill_instance(&address, &req, Duration::from_millis(retry_cycle_ms)).await }
                })
                .await;
                let result = outcome.map_err(ProxyError::InnerCommunication);
                let _ = tx.send(Command::SettleKill(key, result)).await;
            });
        }
        let self_runtime_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = await_settled(rx).await;
            if result.is_ok() {
                let _ = self_runtime_tx.send(Command::InstanceKilled(agent_id, instance_id)).await;
            }
            let _ = reply.send(result);
        });
    }

    async fn query_instance_status(
        &mut self,
        agent_id: AgentId,
        instance_id: InstanceId,
        runtime_mgr_id: RuntimeMgrId,
    ) -> Result<InstanceStatusInfo> {
        let registration = self
            .agents
            .get(&agent_id)
            .ok_or_else(|| ProxyError::NotFound(format!("agent {agent_id}")))?;
        self.agent_client
            .query_instance_status(
                &registration.agent_address,
                instance_id,
                runtime_mgr_id,
                Duration::from_millis(self.config.query_timeout_ms),
            )
            .await
            .map_err(ProxyError::InnerCommunication)
    }

    async fn update_cred(&mut self, agent_id: AgentId, token: String) -> Result<UpdateCredResponse> {
        let registration = self
            .agents
            .get(&agent_id)
            .ok_or_else(|| ProxyError::NotFound(format!("agent {agent_id}")))?;
        self.agent_client
            .update_cred(&registration.agent_address, &token, Duration::from_millis(self.config.update_token_timeout_ms))
            .await
            .map_err(ProxyError::InnerCommunication)
    }

    async fn query_debug_instance(&mut self, instance_id: InstanceId) -> Result<()> {
        let mut merged = serde_json::Map::new();
        for (agent_id, registration) in &self.agents {
            if let Ok(info) = self
                .agent_client
                .query_debug_instance_info(
                    &registration.agent_address,
                    instance_id,
                    Duration::from_millis(self.config.query_timeout_ms),
                )
                .await
            {
                merged.insert(agent_id.to_hex(), info);
            }
        }
        let key = debug_key(&instance_id);
        self.store
            .put(&key, &serde_json::to_vec(&merged).unwrap_or_default())
            .await
            .map(|_| ())
            .map_err(ProxyError::from)
    }

    async fn set_local_status(&mut self, status: LocalStatus) -> Result<()> {
        self.local_status = status;
        self.persist_agent_info().await
    }

    async fn graceful_shutdown(&mut self) -> Result<()> {
        self.local_status = LocalStatus::Evicted;
        let _ = self.persist_agent_info().await;
        self.abnormal = true;

        let targets: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(_, r)| !matches!(r.status, AgentStatus::Failed | AgentStatus::Evicted | AgentStatus::Evicting))
            .map(|(id, _)| *id)
            .collect();

        for agent_id in targets {
            let _ = self.evict_agent(EvictAgentRequest { agent_id, timeout_sec: 0 }).await;
        }

        let key = agent_info_key(&self.node_id);
        self.store.delete(&key).await.map_err(ProxyError::from)
    }

    async fn sync(&mut self) -> Result<()> {
        let key = agent_info_key(&self.node_id);
        match self.store.get(&key).await {
            Ok(Some(entry)) => match serde_json::from_slice::<AgentInfoBlob>(&entry.value) {
                Ok(blob) => {
                    self.address_index =
                        blob.agents.values().map(|r| (r.agent_address.clone(), r.agent_id)).collect();
                    self.agents = blob.agents;
                    self.local_status = blob.local_status;
                }
                Err(err) => {
                    warn!(%err, "failed to parse persisted agent info; proceeding as empty");
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "failed to read persisted agent info; proceeding as empty");
            }
        }
        Ok(())
    }

    async fn recover(&mut self) -> Result<()> {
        self.sync().await?;
        let agent_ids: Vec<AgentId> = self.agents.keys().copied().collect();
        for agent_id in agent_ids {
            let status = self.agents[&agent_id].status;
            match status {
                AgentStatus::Failed | AgentStatus::Evicted => continue,
                AgentStatus::Evicting => {
                    let _ = self.evict_results.send(EvictResult {
                        agent_id,
                        success: true,
                        message: "synthesized on restart: agent was mid-eviction".into(),
                    });
                    if let Some(reg) = self.agents.get_mut(&agent_id) {
                        reg.status = AgentStatus::Evicted;
                    }
                }
                AgentStatus::Success => {
                    let address = self.agents[&agent_id].agent_address.clone();
                    self.runtime.insert(agent_id, AgentRuntimeState::new());
                    self.install_heartbeat(agent_id, address);
                    if let Some(hook) = self.instance_sync.get().await {
                        let _ = hook.sync_instances(agent_id).await;
                    }
                    if let Some(hook) = self.bundle_sync.get().await {
                        let _ = hook.sync_bundles(agent_id).await;
                    }
                    if let Some(state) = self.runtime.get_mut(&agent_id) {
                        state.enabled = true;
                        state.initialized = true;
                    }
                }
            }
        }
        let _ = self.persist_agent_info().await;
        Ok(())
    }

    async fn timeout_event(&mut self, agent_id: AgentId) {
        warn!(%agent_id, "heartbeat lost; running TimeoutEvent");
        self.address_index.retain(|_, v| *v != agent_id);

        if let Some(hook) = self.instance_sync.get().await {
            let _ = hook.put_failed_instance_status_by_agent_id(agent_id).await;
        }

        if let Some(mut state) = self.runtime.remove(&agent_id) {
            for waiter in state.recover_waiters.drain(..) {
                let _ = waiter.send(false);
            }
        }
        let _ = self.resource_view.delete_unit(agent_id.to_hex()).await;

        self.deploy_correlator.clear_agent(agent_id, ProxyError::InnerCommunication("agent timed out".into()));
        self.kill_correlator.clear_agent(agent_id, ProxyError::InnerCommunication("agent timed out".into()));

        if let Some(hook) = self.bundle_sync.get().await {
            let _ = hook.notify_failed_agent(agent_id).await;
        }

        if let Some(reg) = self.agents.get_mut(&agent_id) {
            if reg.status != AgentStatus::Evicted {
                reg.status = AgentStatus::Failed;
                let gc_after = Duration::from_millis(self.config.invalid_agent_gc_interval_ms);
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(gc_after).await;
                    let _ = tx.send(Command::GcFailedAgent(agent_id)).await;
                });
            }
        }
        let _ = self.persist_agent_info().await;
    }

    async fn gc_failed_agent(&mut self, agent_id: AgentId) {
        if let Some(reg) = self.agents.get(&agent_id) {
            if reg.status == AgentStatus::Failed {
                self.agents.remove(&agent_id);
                let _ = self.persist_agent_info().await;
            }
        }
    }

    async fn evict_agent(&mut self, req: EvictAgentRequest) -> Result<()> {
        let Some(reg) = self.agents.get(&req.agent_id).cloned() else {
            return Err(ProxyError::ParameterError(format!("unknown agent {}", req.agent_id)));
        };

        match reg.status {
            AgentStatus::Evicting => return Ok(()),
            AgentStatus::Evicted | AgentStatus::Failed => {
                let _ = self.evict_results.send(EvictResult {
                    agent_id: req.agent_id,
                    success: true,
                    message: "already evicted".into(),
                });
                return Ok(());
            }
            AgentStatus::Success => {}
        }

        if let Some(reg) = self.agents.get_mut(&req.agent_id) {
            reg.status = AgentStatus::Evicting;
            reg.evict_timeout_sec = Some(req.timeout_sec);
        }
        if let Err(err) = self.persist_agent_info().await {
            if let Some(reg) = self.agents.get_mut(&req.agent_id) {
                reg.status = AgentStatus::Success;
                reg.evict_timeout_sec = None;
            }
            return Err(err);
        }

        let _ = self.resource_view.update_unit_status(req.agent_id.to_hex(), UnitStatus::Evicting).await;
        if let Some(hook) = self.bundle_sync.get().await {
            let _ = hook.update_bundles_status(req.agent_id, UnitStatus::Evicting).await;
        }

        let agent_id = req.agent_id;
        let timeout_sec = req.timeout_sec;
        let instance_sync = Arc::clone(&self.instance_sync);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = if let Some(hook) = instance_sync.get().await {
                hook.evict_instance_on_agent(agent_id, timeout_sec).await
            } else {
                Ok(())
            };
            let (success, message) = match result {
                Ok(()) => (true, "evicted successfully".to_string()),
                Err(err) => (false, err.to_string()),
            };
            let _ = self_tx.send(Command::EvictOnAgentCompleted(agent_id, success, message)).await;
        });

        Ok(())
    }

    async fn on_evict_instance_phase_complete(&mut self, agent_id: AgentId, success: bool, message: String) {
        if success {
            let _ = self.resource_view.delete_unit(agent_id.to_hex()).await;
        }
        if let Some(reg) = self.agents.get_mut(&agent_id) {
            reg.status = if success { AgentStatus::Evicted } else { AgentStatus::Success };
            if !success {
                reg.evict_timeout_sec = None;
            }
        }
        let _ = self.persist_agent_info().await;
        let _ = self.evict_results.send(EvictResult { agent_id, success, message });
    }

    async fn instance_killed(&mut self, agent_id: AgentId, instance_id: InstanceId) {
        if self.monopoly_agents.remove(&agent_id) {
            info!(%agent_id, %instance_id, "monopoly kill succeeded; disconnecting exclusive agent");
            self.timeout_event(agent_id).await;
            self.agents.remove(&agent_id);
            let _ = self.persist_agent_info().await;
            return;
        }
        if let Some(state) = self.runtime.get_mut(&agent_id) {
            state.instance_ids.remove(&instance_id);
        }
    }
}

async fn retry_rpc<T, F, Fut>(retry_times: u32, retry_cycle_ms: u64, mut attempt: F) -> std::result::Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, String>>,
{
    let mut last_err = None;
    for _ in 0..=retry_times {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(retry_cycle_ms)).await;
            }
        }
    }
    Err(last_err.expect("at least one attempt always runs"))
}
