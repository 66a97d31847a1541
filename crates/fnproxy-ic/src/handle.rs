//! The public API surface for Instance Control, and its `InstanceSync`
//! implementation against the `Deferred` slot FAM exposes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fnproxy_bm::{BmHandle, ScheduleRequest};
use fnproxy_core::{AgentId, InstanceId, ProxyConfig, ProxyError, Result};
use fnproxy_fam::{FamHandle, InstanceSync};
use fnproxy_resource::ResourceViewHandle;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{Actor, Command};
use crate::control_plane_client::ControlPlaneClient;
use crate::dependencies::DependencyResolver;
use crate::scheduling::SchedulingPolicy;
use crate::types::{AdmissionResponse, InstanceOutcome, KillRequest, KillResponse};

const COMMAND_QUEUE_DEPTH: usize = 1024;

/// A cheap-to-clone handle to a running IC actor.
///
/// Every clone addresses the same actor; all mutation serializes through its
/// mailbox exactly as the concurrency model requires.
#[derive(Clone)]
pub struct IcHandle {
    tx: mpsc::Sender<Command>,
}

impl IcHandle {
    /// Spawn a fresh IC actor and return a handle to it.
    #[must_use]
    pub fn spawn(
        config: Arc<ProxyConfig>,
        resource_view: ResourceViewHandle,
        fam: FamHandle,
        bm: BmHandle,
        policy: Arc<dyn SchedulingPolicy>,
        control_plane: Arc<dyn ControlPlaneClient>,
        dependencies: Arc<dyn DependencyResolver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let actor = Actor {
            config: config.clone(),
            resource_view,
            fam,
            bm,
            policy,
            control_plane,
            dependencies,
            instances: HashMap::new(),
            primary_queue: std::collections::BinaryHeap::new(),
            virtual_queue: std::collections::BinaryHeap::new(),
            rate_limiter: HashMap::new(),
            seq_counter: 0,
            shutting_down: false,
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        let clear_tx = tx.clone();
        let clear_cycle = config.rate_limiter_clear_cycle_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(clear_cycle));
            loop {
                interval.tick().await;
                if clear_tx.send(Command::ClearRateLimiter).await.is_err() {
                    break;
                }
            }
        });

        Self { tx }
    }

    /// Admit a schedule request. Returns once the request has been admitted
    /// into a queue and an initial dispatch attempt has run to completion;
    /// does not itself wait for `Running`, use [`IcHandle::register_ready_callback`] for that.
    pub async fn schedule(&self, req: ScheduleRequest) -> AdmissionResponse {
        self.call_infallible(|reply| Command::Schedule(req, reply)).await
    }

    /// Register a one-shot waiter fired exactly once, on `Running` or a
    /// terminal failure. Fires immediately if the instance has already settled.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] if no instance matches `instance_id`.
    pub async fn register_ready_callback(&self, instance_id: InstanceId) -> Result<oneshot::Receiver<InstanceOutcome>> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.call(|reply| Command::RegisterReadyCallback(instance_id, waiter_tx, reply)).await?;
        Ok(waiter_rx)
    }

    /// Kill an instance, forwarding through the control plane if it is not tracked locally.
    pub async fn kill(&self, req: KillRequest) -> KillResponse {
        self.call_infallible(|reply| Command::Kill(req, reply)).await
    }

    /// Feed an agent-reported status update into the instance's state machine.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] if no instance matches `instance_id`.
    pub async fn update_instance_status(&self, instance_id: InstanceId, status: serde_json::Value) -> Result<()> {
        self.call(|reply| Command::UpdateInstanceStatus(instance_id, status, reply)).await
    }

    /// Classify the most recent failure against `agent_id` as retryable or
    /// terminal, re-enqueuing up to `recover_retry_times` before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] if no instance matches `instance_id`.
    pub async fn reschedule_after_judge_recoverable(&self, instance_id: InstanceId, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Command::RescheduleAfterJudgeRecoverable(instance_id, agent_id, reply)).await
    }

    async fn call<T>(&self, make_cmd: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| ProxyError::InnerCommunication("IC actor unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| ProxyError::InnerCommunication("IC actor dropped reply".into()))?
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
impl InstanceSync for IcHandle {
    async fn sync_instances(&self, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Command::SyncInstances(agent_id, reply)).await
    }

    async fn put_failed_instance_status_by_agent_id(&self, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Command::PutFailedInstanceStatusByAgentId(agent_id, reply)).await
    }

    async fn update_instance_status(&self, instance_id: InstanceId, status: serde_json::Value) -> Result<()> {
        self.update_instance_status(instance_id, status).await
    }

    async fn evict_instance_on_agent(&self, agent_id: AgentId, timeout_sec: u64) -> Result<()> {
        self.call(|reply| Command::EvictInstanceOnAgent(agent_id, timeout_sec, reply)).await
    }
}

impl IcHandle {
    /// Disable further admission, cancel outstanding reservations for
    /// not-yet-dispatched instances, and settle them as `Killed`.
    ///
    /// # Errors
    ///
    /// Only fails if the actor's mailbox is gone.
    pub async fn graceful_shutdown(&self) -> Result<()> {
        self.call(|reply| Command::GracefulShutdown(reply)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane_client::NoopControlPlaneClient;
    use crate::dependencies::AlwaysReadyResolver;
    use crate::scheduling::FirstFitPolicy;
    use async_trait::async_trait;
    use fnproxy_bm::NoopSchedulerClient;
    use fnproxy_core::{InstanceId, NodeId, RequestId, ResourceUnit, RuntimeMgrId};
    use fnproxy_fam::{
        AgentClient, CleanStatusResponse, ClientResult, DeployInstanceRequest, DeployInstanceResponse,
        InstanceStatusInfo, KillInstanceRequest, KillInstanceResponse, RegisterOutcome, RegisterRequest,
        UpdateCredResponse,
    };
    use fnproxy_heartbeat::{HeartbeatConfig, HeartbeatController, HeartbeatHandle, Prober};
    use fnproxy_meta::InMemoryMetaStore;
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
            _req: &DeployInstanceRequest,
            _timeout: Duration,
        ) -> ClientResult<DeployInstanceResponse> {
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

        async fn clean_status(&self, _address: &str, _timeout: Duration) -> ClientResult<CleanStatusResponse> {
            Ok(CleanStatusResponse { acknowledged: true })
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

    fn schedule_request(instance_id: InstanceId, agent_hint: Option<&AgentId>, group: &str) -> ScheduleRequest {
        let mut labels = HashMap::new();
        if let Some(agent_id) = agent_hint {
            labels.insert("agent_id".to_string(), agent_id.to_hex());
        }
        ScheduleRequest {
            request_id: RequestId::generate(),
            instance_id,
            resource_spec: HashMap::from([("CPU".to_string(), 1.0)]),
            labels,
            resource_group_ref: group.to_string(),
            affinity: None,
            priority: 0,
            trace_id: "t1".into(),
        }
    }

    async fn spawn_test_ic() -> (IcHandle, ResourceViewHandle, AgentId) {
        let config = Arc::new(ProxyConfig::default());
        let resource_view = ResourceViewHandle::spawn();

        let heartbeat: Arc<dyn HeartbeatHandle> = Arc::new(HeartbeatController::new(AlwaysUpProber, HeartbeatConfig::default()));
        let fam = FamHandle::spawn(
            NodeId::generate(),
            config.clone(),
            Arc::new(InMemoryMetaStore::new()),
            resource_view.clone(),
            heartbeat,
            Arc::new(EchoAgentClient),
        );
        let bm = BmHandle::spawn(
            NodeId::generate(),
            config.clone(),
            Arc::new(InMemoryMetaStore::new()),
            resource_view.clone(),
            Arc::new(NoopSchedulerClient),
        );

        let ic = IcHandle::spawn(
            config,
            resource_view.clone(),
            fam.clone(),
            bm.clone(),
            Arc::new(FirstFitPolicy),
            Arc::new(NoopControlPlaneClient),
            Arc::new(AlwaysReadyResolver),
        );
        fam.instance_sync_slot().bind(Arc::new(ic.clone())).await;
        fam.bundle_sync_slot().bind(Arc::new(bm.clone())).await;

        let agent_id = AgentId::generate("127.0.0.1:5001", &RuntimeMgrId::generate());
        let registered = fam
            .register(RegisterRequest {
                agent_id,
                agent_address: "127.0.0.1:5001".into(),
                runtime_mgr_id: RuntimeMgrId::generate(),
                initial_unit: ResourceUnit::new(agent_id.to_hex(), HashMap::from([("CPU".to_string(), 10.0)])),
            })
            .await;
        assert_eq!(registered.outcome, RegisterOutcome::Success);

        (ic, resource_view, agent_id)
    }

    #[tokio::test]
    async fn primary_schedule_reaches_running() {
        let (ic, _resource_view, agent_id) = spawn_test_ic().await;
        let instance_id = InstanceId::generate();
        let req = schedule_request(instance_id, None, "");

        let admitted = ic.schedule(req).await;
        assert!(admitted.success);

        let waiter = ic.register_ready_callback(instance_id).await.unwrap();
        match waiter.await.unwrap() {
            InstanceOutcome::Running { agent_id: got } => assert_eq!(got, agent_id),
            other => panic!("expected Running, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_instance_id_rejected() {
        let (ic, _resource_view, _agent_id) = spawn_test_ic().await;
        let instance_id = InstanceId::generate();
        let req = schedule_request(instance_id, None, "");
        let req_dup = schedule_request(instance_id, None, "");

        assert!(ic.schedule(req).await.success);
        let second = ic.schedule(req_dup).await;
        assert!(!second.success);
        assert_eq!(second.message, "duplicate instance_id");
    }

    #[tokio::test]
    async fn kill_before_dispatch_cancels_admission() {
        // A request with resources that do not fit anywhere stays in Scheduling.
        let (ic, resource_view, _agent_id) = spawn_test_ic().await;
        let instance_id = InstanceId::generate();
        let mut req = schedule_request(instance_id, None, "");
        req.resource_spec = HashMap::from([("CPU".to_string(), 999.0)]);
        let _ = resource_view;

        assert!(ic.schedule(req.clone()).await.success);

        let kill_req = KillRequest { request_id: RequestId::generate(), instance_id, force: false };
        let resp = ic.kill(kill_req).await;
        assert!(resp.success);
    }
}
