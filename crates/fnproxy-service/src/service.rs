//! The façade itself: routes each upstream wire message (spec §6) onto the
//! already-built FAM/BM/IC handles and the leader-election collaborator,
//! translating their responses into the Proxy→Upstream messages.
//!
//! `Schedule` is admitted synchronously (mirroring IC's own admission-only
//! contract) and then watched in the background; a terminal failure is
//! pushed onto `sched_abnormal` as `NotifySchedAbnormal`, mirroring how FAM
//! already pushes `NotifyEvictResult` onto `subscribe_evict_results`.

use std::sync::Arc;

use fnproxy_bm::ScheduleRequest;
use fnproxy_core::{AgentId, InstanceId, ProxyError, Result};
use fnproxy_fam::{EvictAgentRequest, FamHandle, RegisterRequest, RegisteredResponse};
use fnproxy_ic::{IcHandle, InstanceOutcome};
use fnproxy_leader::LeaderElector;
use fnproxy_resource::ResourceViewHandle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{
    EvictAgentAck, GracefulShutdownRequest, NotifySchedAbnormal, QueryAgentInfoRequest, QueryResourcesInfoRequest,
    ResponseQueryAgentInfo, ResponseQueryResourcesInfo, TryCancelScheduleRequest, UnRegisterRequest,
    UpdateSchedTopoViewRequest,
};

const SCHED_ABNORMAL_QUEUE_DEPTH: usize = 256;

/// The Local-Scheduler Service: a thin dispatch layer over IC/BM/FAM/L.
///
/// Holds no state of its own beyond the broadcast channel used to fan out
/// `NotifySchedAbnormal`; every durable fact lives in FAM/BM/IC/R.
pub struct LssService {
    fam: FamHandle,
    ic: IcHandle,
    resource_view: ResourceViewHandle,
    leader: Arc<dyn LeaderElector>,
    sched_abnormal: broadcast::Sender<NotifySchedAbnormal>,
}

impl LssService {
    /// Wire a façade around already-spawned component handles.
    #[must_use]
    pub fn new(fam: FamHandle, ic: IcHandle, resource_view: ResourceViewHandle, leader: Arc<dyn LeaderElector>) -> Self {
        let (sched_abnormal, _) = broadcast::channel(SCHED_ABNORMAL_QUEUE_DEPTH);
        Self { fam, ic, resource_view, leader, sched_abnormal }
    }

    /// Subscribe to `NotifySchedAbnormal`; an instance that failed before a
    /// given subscription will never be observed on it.
    #[must_use]
    pub fn subscribe_sched_abnormal(&self) -> broadcast::Receiver<NotifySchedAbnormal> {
        self.sched_abnormal.subscribe()
    }

    /// Subscribe to `NotifyEvictResult`.
    #[must_use]
    pub fn subscribe_evict_results(&self) -> broadcast::Receiver<fnproxy_fam::EvictResult> {
        self.fam.subscribe_evict_results()
    }

    /// Current leadership role, logged purely for operator visibility.
    #[must_use]
    pub fn leader_state(&self) -> fnproxy_leader::LeaderState {
        self.leader.current()
    }

    /// `Register` (Upstream → Proxy, and Proxy ↔ Agent): both directions name
    /// the same `AgentRegistration`-shaped payload in spec §3, so both route
    /// through FAM's one `register` operation.
    pub async fn register(&self, req: RegisterRequest) -> RegisteredResponse {
        self.fam.register(req).await
    }

    /// `UnRegister`: routed to the eviction protocol with no grace period,
    /// since there is no separate hard-remove primitive in FAM.
    pub async fn unregister(&self, req: UnRegisterRequest) -> Result<EvictAgentAck> {
        self.fam
            .evict_agent(EvictAgentRequest { agent_id: req.agent_id, timeout_sec: 0 })
            .await
            .map(|()| EvictAgentAck { accepted: true, message: "unregister accepted".into() })
    }

    /// `UpdateSchedTopoView`: accepted and logged; nothing downstream
    /// consumes cluster topology (see [`crate::types::UpdateSchedTopoViewRequest`]).
    pub fn update_sched_topo_view(&self, req: UpdateSchedTopoViewRequest) {
        debug!(view = %req.view, "received scheduling topology view");
    }

    /// `Schedule`: admits the request into IC, then watches it in the
    /// background so a terminal failure can be pushed as `NotifySchedAbnormal`.
    pub async fn schedule(&self, req: ScheduleRequest) -> fnproxy_ic::AdmissionResponse {
        let instance_id = req.instance_id;
        let response = self.ic.schedule(req).await;
        if response.success {
            self.watch_for_abnormal(instance_id);
        }
        response
    }

    fn watch_for_abnormal(&self, instance_id: InstanceId) {
        let ic = self.ic.clone();
        let sched_abnormal = self.sched_abnormal.clone();
        tokio::spawn(async move {
            let Ok(receiver) = ic.register_ready_callback(instance_id).await else {
                return;
            };
            if let Ok(InstanceOutcome::Terminal { message, .. }) = receiver.await {
                let _ = sched_abnormal.send(NotifySchedAbnormal { instance_id, message });
            }
        });
    }

    /// `TryCancelSchedule`: withdraw an admitted instance before it runs.
    pub async fn try_cancel_schedule(&self, req: TryCancelScheduleRequest) -> fnproxy_ic::KillResponse {
        self.ic
            .kill(fnproxy_ic::KillRequest {
                request_id: fnproxy_core::RequestId::generate(),
                instance_id: req.instance_id,
                force: false,
            })
            .await
    }

    /// `QueryAgentInfo`.
    pub async fn query_agent_info(&self, _req: QueryAgentInfoRequest) -> ResponseQueryAgentInfo {
        ResponseQueryAgentInfo { agents: self.fam.query_agent_info().await }
    }

    /// `QueryResourcesInfo`.
    pub async fn query_resources_info(&self, _req: QueryResourcesInfoRequest) -> ResponseQueryResourcesInfo {
        ResponseQueryResourcesInfo { units: self.resource_view.serialize_view().await }
    }

    /// `EvictAgent`: returns the immediate accept/reject; the eventual
    /// outcome is observable via [`Self::subscribe_evict_results`].
    pub async fn evict_agent(&self, agent_id: AgentId, timeout_sec: u64) -> Result<EvictAgentAck> {
        self.fam
            .evict_agent(EvictAgentRequest { agent_id, timeout_sec })
            .await
            .map(|()| EvictAgentAck { accepted: true, message: "eviction accepted".into() })
    }

    /// `GracefulShutdown`: drains IC first (no new admissions, existing
    /// pending/scheduling instances killed), then FAM (evicts every agent).
    pub async fn graceful_shutdown(&self, _req: GracefulShutdownRequest) -> Result<()> {
        info!("graceful shutdown requested");
        self.ic.graceful_shutdown().await.map_err(log_and_forward)?;
        self.fam.graceful_shutdown().await.map_err(log_and_forward)?;
        Ok(())
    }
}

fn log_and_forward(err: ProxyError) -> ProxyError {
    warn!(error = %err, "graceful shutdown step failed");
    err
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use fnproxy_core::{NodeId, ProxyConfig, ResourceUnit, RuntimeMgrId};
    use fnproxy_fam::{AgentClient, CleanStatusResponse, ClientResult, DeployInstanceRequest, DeployInstanceResponse, InstanceStatusInfo, KillInstanceRequest, KillInstanceResponse, RegisterOutcome, UpdateCredResponse};
    use fnproxy_heartbeat::{HeartbeatConfig, HeartbeatController, HeartbeatHandle, Prober};
    use fnproxy_ic::{AlwaysReadyResolver, FirstFitPolicy, NoopControlPlaneClient};
    use fnproxy_leader::StandaloneLeader;
    use fnproxy_meta::InMemoryMetaStore;

    use super::*;

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
            _timeout: std::time::Duration,
        ) -> ClientResult<DeployInstanceResponse> {
            Ok(DeployInstanceResponse { success: true, message: format!("deployed {}", req.instance_id) })
        }

        async fn kill_instance(
            &self,
            _address: &str,
            req: &KillInstanceRequest,
            _timeout: std::time::Duration,
        ) -> ClientResult<KillInstanceResponse> {
            Ok(KillInstanceResponse { success: true, message: format!("killed {}", req.instance_id) })
        }

        async fn query_instance_status(
            &self,
            _address: &str,
            instance_id: fnproxy_core::InstanceId,
            _runtime_mgr_id: fnproxy_core::RuntimeMgrId,
            _timeout: std::time::Duration,
        ) -> ClientResult<InstanceStatusInfo> {
            Ok(InstanceStatusInfo { instance_id, status: serde_json::json!({"phase": "running"}) })
        }

        async fn update_cred(&self, _address: &str, _token: &str, _timeout: std::time::Duration) -> ClientResult<UpdateCredResponse> {
            Ok(UpdateCredResponse { success: true })
        }

        async fn clean_status(&self, _address: &str, _timeout: std::time::Duration) -> ClientResult<CleanStatusResponse> {
            Ok(CleanStatusResponse { acknowledged: true })
        }

        async fn query_debug_instance_info(
            &self,
            _address: &str,
            _instance_id: fnproxy_core::InstanceId,
            _timeout: std::time::Duration,
        ) -> ClientResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn spawn_service() -> LssService {
        let config = Arc::new(ProxyConfig::default());
        let resource_view = ResourceViewHandle::spawn();
        let heartbeat: Arc<dyn HeartbeatHandle> =
            HeartbeatController::new(AlwaysUpProber, HeartbeatConfig::default());
        let fam_store = Arc::new(InMemoryMetaStore::new());
        let bm_store = Arc::new(InMemoryMetaStore::new());

        let fam = FamHandle::spawn(
            NodeId::generate(),
            Arc::clone(&config),
            fam_store,
            resource_view.clone(),
            heartbeat,
            Arc::new(EchoAgentClient),
        );
        let bm = fnproxy_bm::BmHandle::spawn(
            NodeId::generate(),
            Arc::clone(&config),
            bm_store,
            resource_view.clone(),
            Arc::new(fnproxy_bm::NoopSchedulerClient),
        );
        let ic = IcHandle::spawn(
            Arc::clone(&config),
            resource_view.clone(),
            fam.clone(),
            bm.clone(),
            Arc::new(FirstFitPolicy),
            Arc::new(NoopControlPlaneClient),
            Arc::new(AlwaysReadyResolver),
        );
        fam.instance_sync_slot().bind(Arc::new(ic.clone()));
        fam.bundle_sync_slot().bind(Arc::new(bm.clone()));

        let leader: Arc<dyn LeaderElector> = Arc::new(StandaloneLeader::default());
        let service = LssService::new(fam.clone(), ic, resource_view, leader);

        let agent_id = fnproxy_core::AgentId::generate("127.0.0.1:5001", &RuntimeMgrId::generate());
        let registered = service
            .register(RegisterRequest {
                agent_id,
                agent_address: "127.0.0.1:5001".into(),
                runtime_mgr_id: RuntimeMgrId::generate(),
                initial_unit: ResourceUnit::new(agent_id.to_hex(), HashMap::from([("CPU".to_string(), 10.0)])),
            })
            .await;
        assert_eq!(registered.outcome, RegisterOutcome::Success);

        service
    }

    #[tokio::test]
    async fn register_then_query_agent_info_lists_it() {
        let service = spawn_service().await;
        let response = service.query_agent_info(QueryAgentInfoRequest).await;
        assert_eq!(response.agents.len(), 1);
    }

    #[tokio::test]
    async fn query_resources_info_reflects_seeded_unit() {
        let service = spawn_service().await;
        let response = service.query_resources_info(QueryResourcesInfoRequest).await;
        assert_eq!(response.units.len(), 1);
    }

    #[tokio::test]
    async fn schedule_admits_and_eventually_reaches_running() {
        let service = spawn_service().await;
        let mut abnormal_rx = service.subscribe_sched_abnormal();

        let req = ScheduleRequest {
            request_id: fnproxy_core::RequestId::generate(),
            instance_id: fnproxy_core::InstanceId::generate(),
            resource_spec: HashMap::from([("CPU".to_string(), 1.0)]),
            labels: HashMap::new(),
            resource_group_ref: String::new(),
            affinity: None,
            priority: 0,
            trace_id: "trace-1".into(),
        };
        let response = service.schedule(req).await;
        assert!(response.success);

        // No abnormal notification should fire for a request that can be
        // deployed onto the single registered agent's ample capacity.
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), abnormal_rx.recv()).await;
        assert!(result.is_err(), "unexpected abnormal notification: {result:?}");
    }

    #[tokio::test]
    async fn leader_state_defaults_to_leader_standalone() {
        let service = spawn_service().await;
        assert_eq!(service.leader_state(), fnproxy_leader::LeaderState::Leader);
    }

    #[tokio::test]
    async fn graceful_shutdown_succeeds() {
        let service = spawn_service().await;
        service.graceful_shutdown(GracefulShutdownRequest).await.unwrap();
    }
}
