//! The Instance Control actor: a single-threaded state machine driving every
//! instance admitted on this node from `Pending` through to a terminal
//! status, serialized through one mailbox exactly as the concurrency model
//! requires of FAM and BM.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use fnproxy_bm::{BmHandle, ScheduleRequest};
use fnproxy_core::{AgentId, InstanceId, ProxyConfig, ProxyError, RequestId, Result};
use fnproxy_fam::{DeployInstanceRequest, FamHandle, KillInstanceRequest};
use fnproxy_resource::{ResourceViewHandle, UpdateType};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::control_plane_client::ControlPlaneClient;
use crate::dependencies::DependencyResolver;
use crate::scheduling::SchedulingPolicy;
use crate::types::{AdmissionEntry, AdmissionResponse, Instance, InstanceOutcome, InstanceStatus, KillRequest, KillResponse};

pub(crate) enum Command {
    Schedule(ScheduleRequest, oneshot::Sender<AdmissionResponse>),
    RegisterReadyCallback(InstanceId, oneshot::Sender<InstanceOutcome>, oneshot::Sender<Result<()>>),
    Kill(KillRequest, oneshot::Sender<KillResponse>),
    UpdateInstanceStatus(InstanceId, serde_json::Value, oneshot::Sender<Result<()>>),
    RescheduleAfterJudgeRecoverable(InstanceId, AgentId, oneshot::Sender<Result<()>>),
    EvictInstanceOnAgent(AgentId, u64, oneshot::Sender<Result<()>>),
    GracefulShutdown(oneshot::Sender<Result<()>>),
    SyncInstances(AgentId, oneshot::Sender<Result<()>>),
    PutFailedInstanceStatusByAgentId(AgentId, oneshot::Sender<Result<()>>),
    AdmissionTimeout(InstanceId),
    ClearRateLimiter,
}

pub(crate) struct Actor {
    pub config: Arc<ProxyConfig>,
    pub resource_view: ResourceViewHandle,
    pub fam: FamHandle,
    pub bm: BmHandle,
    pub policy: Arc<dyn SchedulingPolicy>,
    pub control_plane: Arc<dyn ControlPlaneClient>,
    pub dependencies: Arc<dyn DependencyResolver>,
    pub instances: HashMap<InstanceId, Instance>,
    pub primary_queue: BinaryHeap<AdmissionEntry>,
    pub virtual_queue: BinaryHeap<AdmissionEntry>,
    pub rate_limiter: HashMap<String, u32>,
    pub seq_counter: u64,
    pub shutting_down: bool,
    pub self_tx: mpsc::Sender<Command>,
}

impl Actor {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Schedule(req, reply) => {
                    let resp = self.schedule(req).await;
                    let _ = reply.send(resp);
                }
                Command::RegisterReadyCallback(instance_id, waiter, reply) => {
                    let result = self.register_ready_callback(instance_id, waiter);
                    let _ = reply.send(result);
                }
                Command::Kill(req, reply) => {
                    let resp = self.kill(req).await;
                    let _ = reply.send(resp);
                }
                Command::UpdateInstanceStatus(instance_id, status, reply) => {
                    let result = self.update_instance_status(instance_id, status).await;
                    let _ = reply.send(result);
                }
                Command::RescheduleAfterJudgeRecoverable(instance_id, agent_id, reply) => {
                    let result = self.reschedule_after_judge_recoverable(instance_id, agent_id).await;
                    let _ = reply.send(result);
                }
                Command::EvictInstanceOnAgent(agent_id, timeout_sec, reply) => {
                    let result = self.evict_instance_on_agent(agent_id, timeout_sec).await;
                    let _ = reply.send(result);
                }
                Command::GracefulShutdown(reply) => {
                    let result = self.graceful_shutdown().await;
                    let _ = reply.send(result);
                }
                Command::SyncInstances(agent_id, reply) => {
                    debug!(%agent_id, "sync_instances: IC's own table is authoritative, nothing to reconcile");
                    let _ = reply.send(Ok(()));
                }
                Command::PutFailedInstanceStatusByAgentId(agent_id, reply) => {
                    let result = self.put_failed_instance_status_by_agent_id(agent_id).await;
                    let _ = reply.send(result);
                }
                Command::AdmissionTimeout(instance_id) => {
                    self.admission_timeout(instance_id).await;
                }
                Command::ClearRateLimiter => {
                    self.rate_limiter.clear();
                }
            }
        }
    }

    fn is_virtual(req: &ScheduleRequest) -> bool {
        !req.resource_group_ref.is_empty()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq_counter += 1;
        self.seq_counter
    }

    fn queue_mut(&mut self, virtual_req: bool) -> &mut BinaryHeap<AdmissionEntry> {
        if virtual_req {
            &mut self.virtual_queue
        } else {
            &mut self.primary_queue
        }
    }

    fn remove_from_queue(&mut self, virtual_req: bool, instance_id: InstanceId) {
        let queue = self.queue_mut(virtual_req);
        let retained: Vec<AdmissionEntry> = queue.drain().filter(|e| e.instance_id != instance_id).collect();
        *queue = retained.into_iter().collect();
    }

    async fn schedule(&mut self, req: ScheduleRequest) -> AdmissionResponse {
        if self.shutting_down {
            return AdmissionResponse { success: false, message: "local scheduler abnormal: shutting down".into() };
        }
        if self.instances.contains_key(&req.instance_id) {
            return AdmissionResponse { success: false, message: "duplicate instance_id".into() };
        }
        if let Err(reason) = self.dependencies.check(&req).await {
            return AdmissionResponse { success: false, message: format!("dependency error: {reason}") };
        }

        let instance_id = req.instance_id;
        let virtual_req = Self::is_virtual(&req);
        let priority = req.priority;
        let seq = self.next_seq();

        self.instances.insert(
            instance_id,
            Instance {
                instance_id,
                status: InstanceStatus::Scheduling,
                seq,
                request: req,
                agent_id: None,
                retry_count: 0,
                ready_waiters: Vec::new(),
            },
        );
        self.queue_mut(virtual_req).push(AdmissionEntry { priority, seq, instance_id });

        self.attempt_dispatch(instance_id).await;
        AdmissionResponse { success: true, message: "admitted".into() }
    }

    async fn attempt_dispatch(&mut self, instance_id: InstanceId) {
        let Some(instance) = self.instances.get(&instance_id) else { return };
        if instance.status != InstanceStatus::Scheduling {
            return;
        }
        let req = instance.request.clone();
        let virtual_req = Self::is_virtual(&req);

        let agent_id = if virtual_req {
            let resp = self.bm.reserve(req.resource_group_ref.clone(), req.clone()).await;
            if !resp.success {
                warn!(%instance_id, message = %resp.message, "reserve denied, waiting in queue for capacity");
                self.arm_queue_timeout(instance_id);
                return;
            }
            let Some(agent_id) = resp.agent_id else {
                self.fail_immediately(instance_id, "reserve granted with no agent assignment".into()).await;
                return;
            };
            let bound = self.bm.bind(req.request_id).await;
            if !bound.success {
                self.fail_immediately(instance_id, bound.message).await;
                return;
            }
            agent_id
        } else {
            let candidates = self.resource_view.serialize_view().await;
            let Some(agent_hex) = self.policy.select_agent(&req, &candidates).await else {
                self.arm_queue_timeout(instance_id);
                return;
            };
            let Ok(agent_id) = AgentId::from_hex(&agent_hex) else {
                self.fail_immediately(instance_id, "invalid agent id from scheduling policy".into()).await;
                return;
            };
            if let Err(e) = self.apply_actual_allocation(&agent_id, &req).await {
                self.fail_immediately(instance_id, format!("failed to reserve capacity: {e}")).await;
                return;
            }
            agent_id
        };

        self.remove_from_queue(virtual_req, instance_id);
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.status = InstanceStatus::Creating;
            instance.agent_id = Some(agent_id);
        }

        let deploy_req = DeployInstanceRequest {
            request_id: req.request_id,
            instance_id,
            spec: serde_json::json!({
                "resource_spec": req.resource_spec,
                "labels": req.labels,
                "affinity": req.affinity,
                "priority": req.priority,
                "trace_id": req.trace_id,
            }),
        };

        match self.fam.deploy_instance(agent_id, deploy_req).await {
            Ok(resp) if resp.success => self.transition_running(instance_id, agent_id),
            Ok(resp) => self.on_deploy_failed(instance_id, agent_id, &req, resp.message).await,
            Err(e) => self.on_deploy_failed(instance_id, agent_id, &req, e.to_string()).await,
        }
    }

    fn arm_queue_timeout(&self, instance_id: InstanceId) {
        let self_tx = self.self_tx.clone();
        let timeout_ms = self.config.schedule_queue_timeout_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = self_tx.send(Command::AdmissionTimeout(instance_id)).await;
        });
    }

    async fn admission_timeout(&mut self, instance_id: InstanceId) {
        let Some(instance) = self.instances.get(&instance_id) else { return };
        if instance.status != InstanceStatus::Scheduling {
            return;
        }
        let virtual_req = Self::is_virtual(&instance.request);
        self.remove_from_queue(virtual_req, instance_id);
        let err = ProxyError::ResourceNotEnough(format!("no capacity within {}ms", self.config.schedule_queue_timeout_ms));
        self.transition_terminal(instance_id, InstanceStatus::Failed, err.to_string());
    }

    /// Primary (non-bundle-backed) allocation: deducts directly from the
    /// agent's unit rather than going through BM's bundle fragments.
    async fn apply_actual_allocation(&self, agent_id: &AgentId, req: &ScheduleRequest) -> Result<()> {
        let Some(mut unit) = self.resource_view.get_unit(agent_id.to_hex()).await else {
            return Err(ProxyError::NotFound(format!("resource unit for agent {agent_id}")));
        };
        for (kind, amount) in &req.resource_spec {
            *unit.usage.entry(kind.clone()).or_insert(0.0) += amount;
        }
        unit.instances.push(req.instance_id.to_hex());
        self.resource_view.update_unit(unit, UpdateType::Actual).await
    }

    async fn rollback_actual_allocation(&self, agent_id: &AgentId, req: &ScheduleRequest) {
        let Some(mut unit) = self.resource_view.get_unit(agent_id.to_hex()).await else { return };
        for (kind, amount) in &req.resource_spec {
            if let Some(usage) = unit.usage.get_mut(kind) {
                *usage = (*usage - amount).max(0.0);
            }
        }
        unit.instances.retain(|id| id != &req.instance_id.to_hex());
        let _ = self.resource_view.update_unit(unit, UpdateType::Actual).await;
    }

    /// A bundle's resource-group reservation outlives any one instance's
    /// deploy outcome, so only the primary path's per-instance allocation is
    /// rolled back here; a bundle stays bound and is retried against on the
    /// next dispatch attempt.
    async fn release_allocation(&self, agent_id: AgentId, req: &ScheduleRequest) {
        if !Self::is_virtual(req) {
            self.rollback_actual_allocation(&agent_id, req).await;
        }
    }

    fn is_recoverable_failure(message: &str) -> bool {
        let lower = message.to_lowercase();
        !lower.contains("no-such-function") && !lower.contains("fatal")
    }

    async fn on_deploy_failed(&mut self, instance_id: InstanceId, agent_id: AgentId, req: &ScheduleRequest, message: String) {
        self.release_allocation(agent_id, req).await;
        if Self::is_recoverable_failure(&message) {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                instance.status = InstanceStatus::Recoverable;
            }
            warn!(%instance_id, %agent_id, %message, "deploy failed, judged recoverable");
            let _ = self.reschedule_after_judge_recoverable(instance_id, agent_id).await;
        } else {
            self.transition_terminal(instance_id, InstanceStatus::Failed, message);
        }
    }

    async fn reschedule_after_judge_recoverable(&mut self, instance_id: InstanceId, agent_id: AgentId) -> Result<()> {
        let (exhausted, req) = {
            let Some(instance) = self.instances.get_mut(&instance_id) else {
                return Err(ProxyError::NotFound(format!("instance {instance_id}")));
            };
            if instance.status.is_terminal() {
                return Ok(());
            }
            instance.retry_count += 1;
            (instance.retry_count > self.config.recover_retry_times, instance.request.clone())
        };

        if exhausted {
            let message = format!("exceeded recover_retry_times against agent {agent_id}");
            self.transition_terminal(instance_id, InstanceStatus::Failed, message);
            return Ok(());
        }

        let seq = self.next_seq();
        let virtual_req = Self::is_virtual(&req);
        let priority = req.priority;
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.status = InstanceStatus::Scheduling;
            instance.agent_id = None;
            instance.seq = seq;
        }
        self.queue_mut(virtual_req).push(AdmissionEntry { priority, seq, instance_id });
        self.attempt_dispatch(instance_id).await;
        Ok(())
    }

    fn transition_running(&mut self, instance_id: InstanceId, agent_id: AgentId) {
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.status = InstanceStatus::Running;
            instance.agent_id = Some(agent_id);
            let outcome = InstanceOutcome::Running { agent_id };
            instance.notify_ready_waiters(&outcome);
        }
    }

    fn transition_terminal(&mut self, instance_id: InstanceId, status: InstanceStatus, message: String) {
        let outcome = InstanceOutcome::Terminal { status, message };
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.status = status;
            instance.agent_id = None;
            instance.notify_ready_waiters(&outcome);
        }
    }

    async fn fail_immediately(&mut self, instance_id: InstanceId, message: String) {
        let virtual_req = self.instances.get(&instance_id).map(|i| Self::is_virtual(&i.request)).unwrap_or(false);
        self.remove_from_queue(virtual_req, instance_id);
        self.transition_terminal(instance_id, InstanceStatus::Failed, message);
    }

    fn register_ready_callback(&mut self, instance_id: InstanceId, waiter: oneshot::Sender<InstanceOutcome>) -> Result<()> {
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            return Err(ProxyError::NotFound(format!("instance {instance_id}")));
        };
        match instance.status {
            InstanceStatus::Running => {
                let agent_id = instance.agent_id.expect("a Running instance always has an agent");
                let _ = waiter.send(InstanceOutcome::Running { agent_id });
            }
            status if status.is_terminal() => {
                let _ = waiter.send(InstanceOutcome::Terminal { status, message: "already settled".into() });
            }
            _ => instance.ready_waiters.push(waiter),
        }
        Ok(())
    }

    async fn kill(&mut self, req: KillRequest) -> KillResponse {
        let note_key = req.instance_id.to_hex();
        *self.rate_limiter.entry(note_key).or_insert(0) += 1;

        let Some(instance) = self.instances.get(&req.instance_id) else {
            return self.forward_kill(req).await;
        };
        if instance.status.is_terminal() {
            return KillResponse { success: true, message: "function agent may already exited".into() };
        }
        let agent_id = instance.agent_id;
        let sched_req = instance.request.clone();

        let Some(agent_id) = agent_id else {
            if Self::is_virtual(&sched_req) {
                let _ = self.bm.unreserve(sched_req.request_id).await;
            }
            self.remove_from_queue(Self::is_virtual(&sched_req), req.instance_id);
            self.transition_terminal(req.instance_id, InstanceStatus::Killed, "cancelled before dispatch".into());
            return KillResponse { success: true, message: "cancelled before dispatch".into() };
        };

        let kill_req =
            KillInstanceRequest { request_id: req.request_id, instance_id: req.instance_id, force: req.force, is_monopoly: false };
        match self.fam.kill_instance(agent_id, kill_req, false).await {
            Ok(resp) if resp.success => {
                self.release_allocation(agent_id, &sched_req).await;
                self.transition_terminal(req.instance_id, InstanceStatus::Killed, resp.message.clone());
                KillResponse { success: true, message: resp.message }
            }
            Ok(resp) => KillResponse { success: false, message: resp.message },
            Err(e) => KillResponse { success: false, message: e.to_string() },
        }
    }

    async fn forward_kill(&self, req: KillRequest) -> KillResponse {
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        for attempt in 0..=self.config.max_forward_kill_retry_times {
            match self.control_plane.forward_kill(req.instance_id, req.force, timeout).await {
                Ok(success) => {
                    return KillResponse {
                        success,
                        message: if success { "forwarded".into() } else { "forward kill rejected".into() },
                    };
                }
                Err(e) => {
                    warn!(attempt, error = %e, instance_id = %req.instance_id, "forward-kill attempt failed");
                    if attempt < self.config.max_forward_kill_retry_times {
                        tokio::time::sleep(Duration::from_millis(self.config.max_forward_kill_retry_cycle_ms)).await;
                    }
                }
            }
        }
        KillResponse { success: false, message: "forward kill exhausted retry budget".into() }
    }

    async fn update_instance_status(&mut self, instance_id: InstanceId, status: serde_json::Value) -> Result<()> {
        let Some((is_terminal, agent_id, sched_req)) =
            self.instances.get(&instance_id).map(|i| (i.status.is_terminal(), i.agent_id, i.request.clone()))
        else {
            return Err(ProxyError::NotFound(format!("instance {instance_id}")));
        };
        if is_terminal {
            return Ok(());
        }
        let phase = status.get("phase").and_then(|v| v.as_str()).unwrap_or("");
        match (phase, agent_id) {
            ("running", Some(agent_id)) => self.transition_running(instance_id, agent_id),
            ("exited" | "failed", Some(agent_id)) => {
                self.on_deploy_failed(instance_id, agent_id, &sched_req, "agent reported exit".into()).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn evict_instance_on_agent(&mut self, agent_id: AgentId, timeout_sec: u64) -> Result<()> {
        let ids: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.agent_id == Some(agent_id) && !i.status.is_terminal())
            .map(|i| i.instance_id)
            .collect();

        for instance_id in ids {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                instance.status = InstanceStatus::Evicting;
            }
            let graceful_req =
                KillInstanceRequest { request_id: RequestId::generate(), instance_id, force: false, is_monopoly: false };
            let graceful = self.fam.kill_instance(agent_id, graceful_req, true).await;
            let succeeded = matches!(graceful, Ok(resp) if resp.success);
            if !succeeded {
                if timeout_sec > 0 {
                    tokio::time::sleep(Duration::from_secs(timeout_sec)).await;
                }
                let forced_req =
                    KillInstanceRequest { request_id: RequestId::generate(), instance_id, force: true, is_monopoly: false };
                let _ = self.fam.kill_instance(agent_id, forced_req, true).await;
            }
            self.transition_terminal(instance_id, InstanceStatus::Evicted, "evicted with agent".into());
        }
        Ok(())
    }

    async fn put_failed_instance_status_by_agent_id(&mut self, agent_id: AgentId) -> Result<()> {
        let ids: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.agent_id == Some(agent_id) && !i.status.is_terminal())
            .map(|i| i.instance_id)
            .collect();
        for instance_id in ids {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                instance.status = InstanceStatus::Recoverable;
            }
            let _ = self.reschedule_after_judge_recoverable(instance_id, agent_id).await;
        }
        Ok(())
    }

    /// IC's dispatch is synchronous within a single admission's actor turn, so
    /// nothing is ever mid-deploy across mailbox turns; "drain in-flight
    /// deploys" reduces to rejecting further admission, which `shutting_down` does.
    async fn graceful_shutdown(&mut self) -> Result<()> {
        self.shutting_down = true;
        let pending: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| matches!(i.status, InstanceStatus::Pending | InstanceStatus::Scheduling))
            .map(|i| i.instance_id)
            .collect();

        for instance_id in pending {
            let sched_req = self.instances.get(&instance_id).map(|i| i.request.clone());
            if let Some(sched_req) = sched_req {
                if Self::is_virtual(&sched_req) {
                    let _ = self.bm.unreserve(sched_req.request_id).await;
                }
                self.remove_from_queue(Self::is_virtual(&sched_req), instance_id);
            }
            self.transition_terminal(instance_id, InstanceStatus::Killed, "graceful shutdown".into());
        }
        Ok(())
    }
}
