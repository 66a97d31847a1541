//! The Bundle Manager actor: single-threaded owner of every bundle and
//! in-flight reservation on this node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fnproxy_core::{AgentId, BundleId, NodeId, ProxyError, RequestId, Result, ResourceUnit, UnitStatus};
use fnproxy_meta::{CoalescingPersister, MetaStore};
use fnproxy_resource::{ResourceViewHandle, UpdateType};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::scheduler_client::{Decision, SchedulerClient};
use crate::types::{Bundle, BundleStatus, BundlesBlob, GroupResponse, ReservedContext, ScheduleRequest, ScheduleResponse};

fn bundles_key(node_id: &NodeId) -> Vec<u8> {
    format!("/yr/bundles/{node_id}").into_bytes()
}

pub(crate) enum Command {
    Reserve(String, ScheduleRequest, oneshot::Sender<ScheduleResponse>),
    Unreserve(RequestId, oneshot::Sender<Result<()>>),
    Bind(RequestId, oneshot::Sender<GroupResponse>),
    Unbind(BundleId, oneshot::Sender<GroupResponse>),
    RemoveBundle(BundleId, oneshot::Sender<Result<()>>),
    SyncBundles(AgentId, oneshot::Sender<Result<()>>),
    SyncFailedBundles(HashMap<AgentId, bool>, oneshot::Sender<Result<()>>),
    NotifyFailedAgent(AgentId, oneshot::Sender<Result<()>>),
    UpdateBundlesStatus(AgentId, UnitStatus, oneshot::Sender<Result<()>>),
    ReserveExpired(RequestId),
}

pub(crate) struct Actor<M: MetaStore> {
    pub node_id: NodeId,
    pub config: Arc<fnproxy_core::ProxyConfig>,
    pub store: Arc<M>,
    pub resource_view: ResourceViewHandle,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub persister: Arc<CoalescingPersister>,
    pub bundles: HashMap<BundleId, Bundle>,
    pub reservations: HashMap<RequestId, ReservedContext>,
    pub group_counters: HashMap<String, u32>,
    pub self_tx: mpsc::Sender<Command>,
}

impl<M: MetaStore + 'static> Actor<M> {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Reserve(name, req, reply) => {
                    let resp = self.reserve(&name, req).await;
                    let _ = reply.send(resp);
                }
                Command::Unreserve(request_id, reply) => {
                    let result = self.unreserve(request_id).await;
                    let _ = reply.send(result);
                }
                Command::Bind(request_id, reply) => {
                    let resp = self.bind(request_id).await;
                    let _ = reply.send(resp);
                }
                Command::Unbind(bundle_id, reply) => {
                    let resp = self.unbind(bundle_id).await;
                    let _ = reply.send(resp);
                }
                Command::RemoveBundle(bundle_id, reply) => {
                    let result = self.remove_bundle_internal(bundle_id).await;
                    let _ = reply.send(result);
                }
                Command::SyncBundles(agent_id, reply) => {
                    let result = self.sync_bundles(agent_id).await;
                    let _ = reply.send(result);
                }
                Command::SyncFailedBundles(agent_map, reply) => {
                    let result = self.sync_failed_bundles(&agent_map).await;
                    let _ = reply.send(result);
                }
                Command::NotifyFailedAgent(agent_id, reply) => {
                    let result = self.notify_failed_agent(agent_id).await;
                    let _ = reply.send(result);
                }
                Command::UpdateBundlesStatus(agent_id, status, reply) => {
                    let result = self.update_bundles_status(agent_id, status).await;
                    let _ = reply.send(result);
                }
                Command::ReserveExpired(request_id) => {
                    self.reserve_expired(request_id).await;
                }
            }
        }
        debug!("bundle manager actor shutting down: no more handles");
    }

    async fn persist_bundles(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let key = bundles_key(&self.node_id);
        let bundles = self.bundles.clone();
        self.persister
            .persist(store, key, move || {
                serde_json::to_vec(&BundlesBlob { bundles: bundles.clone() }).unwrap_or_default()
            })
            .await
            .map_err(ProxyError::from)
    }

    async fn reserve(&mut self, name: &str, req: ScheduleRequest) -> ScheduleResponse {
        if name != req.resource_group_ref {
            return ScheduleResponse {
                success: false,
                request_id: req.request_id,
                agent_id: None,
                message: "resource group name does not match request".into(),
            };
        }
        if self.reservations.contains_key(&req.request_id) {
            return ScheduleResponse {
                success: false,
                request_id: req.request_id,
                agent_id: None,
                message: "duplicate request_id".into(),
            };
        }

        let decision = match self.scheduler.decide(&req, Duration::from_millis(self.config.query_timeout_ms)).await {
            Ok(decision) => decision,
            Err(e) => {
                return ScheduleResponse {
                    success: false,
                    request_id: req.request_id,
                    agent_id: None,
                    message: format!("scheduler communication failed: {e}"),
                }
            }
        };

        let result = match decision {
            Decision::Granted(result) => result,
            Decision::Denied(reason) => {
                return ScheduleResponse { success: false, request_id: req.request_id, agent_id: None, message: reason }
            }
        };

        let Some(agent_unit) = self.resource_view.get_unit(result.agent_id.to_hex()).await else {
            return ScheduleResponse {
                success: false,
                request_id: req.request_id,
                agent_id: None,
                message: format!("resource view has no unit for agent {}", result.agent_id),
            };
        };

        let bundle_index = *self.group_counters.entry(name.to_string()).and_modify(|n| *n += 1).or_insert(0);
        let bundle_id = BundleId::generate(name, bundle_index);
        let bundle = Bundle {
            bundle_id,
            owning_agent_id: result.agent_id,
            resource_group_name: name.to_string(),
            bundle_index,
            resources: result.allocated.clone(),
            status: BundleStatus::Normal,
            reserved_until: None,
        };

        if let Err(e) = self.apply_virtual_deduction(&agent_unit, &bundle, &req).await {
            warn!(request_id = %req.request_id, error = %e, "failed to apply virtual pre-deduction");
            return ScheduleResponse {
                success: false,
                request_id: req.request_id,
                agent_id: None,
                message: format!("failed to update resource view: {e}"),
            };
        }

        let self_tx = self.self_tx.clone();
        let request_id = req.request_id;
        let timeout_ms = self.config.bundle_reserve_timeout_ms;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = self_tx.send(Command::ReserveExpired(request_id)).await;
        });

        let agent_id = result.agent_id;
        self.reservations.insert(
            req.request_id,
            ReservedContext {
                schedule_result: result,
                reserve_expire_timer: timer,
                bundle,
                resource_group_name: name.to_string(),
            },
        );

        ScheduleResponse { success: true, request_id: req.request_id, agent_id: Some(agent_id), message: "reserved".into() }
    }

    async fn apply_virtual_deduction(&self, agent_unit: &ResourceUnit, bundle: &Bundle, req: &ScheduleRequest) -> Result<()> {
        let mut updated = agent_unit.clone();
        for (kind, amount) in &bundle.resources {
            *updated.usage.entry(kind.clone()).or_insert(0.0) += amount;
        }
        updated.fragment.insert(
            bundle.bundle_id.to_hex(),
            ResourceUnit {
                id: bundle.bundle_id.to_hex(),
                owner_id: Some(agent_unit.id.clone()),
                capacity: bundle.resources.clone(),
                usage: HashMap::new(),
                fragment: HashMap::new(),
                status: UnitStatus::Normal,
                instances: vec![req.instance_id.to_hex()],
            },
        );
        self.resource_view.update_unit(updated, UpdateType::Virtual).await
    }

    async fn rollback_virtual_deduction(&self, bundle: &Bundle) {
        let Some(agent_unit) = self.resource_view.get_unit(bundle.owning_agent_id.to_hex()).await else {
            return;
        };
        let mut updated = agent_unit;
        for (kind, amount) in &bundle.resources {
            if let Some(usage) = updated.usage.get_mut(kind) {
                *usage = (*usage - amount).max(0.0);
            }
        }
        updated.fragment.remove(&bundle.bundle_id.to_hex());
        if let Err(e) = self.resource_view.update_unit(updated, UpdateType::Virtual).await {
            warn!(bundle_id = %bundle.bundle_id, error = %e, "failed to roll back virtual pre-deduction");
        }
    }

    async fn unreserve(&mut self, request_id: RequestId) -> Result<()> {
        let Some(ctx) = self.reservations.remove(&request_id) else {
            return Err(ProxyError::NotFound(format!("reservation {request_id}")));
        };
        ctx.reserve_expire_timer.abort();
        self.rollback_virtual_deduction(&ctx.bundle).await;
        if let Err(e) = self.scheduler.release(&ctx.schedule_result.binding_token, Duration::from_millis(self.config.query_timeout_ms)).await {
            warn!(request_id = %request_id, error = %e, "best-effort scheduler release failed");
        }
        Ok(())
    }

    async fn reserve_expired(&mut self, request_id: RequestId) {
        let Some(ctx) = self.reservations.remove(&request_id) else { return };
        info!(request_id = %request_id, "bundle reservation expired unbound");
        self.rollback_virtual_deduction(&ctx.bundle).await;
        if let Err(e) = self.scheduler.release(&ctx.schedule_result.binding_token, Duration::from_millis(self.config.query_timeout_ms)).await {
            warn!(request_id = %request_id, error = %e, "best-effort scheduler release failed on expiry");
        }
    }

    async fn bind(&mut self, request_id: RequestId) -> GroupResponse {
        let id = request_id.to_hex();
        let Some(ctx) = self.reservations.remove(&request_id) else {
            return GroupResponse { success: false, id, message: "not found".into() };
        };
        ctx.reserve_expire_timer.abort();

        let bundle = ctx.bundle;
        self.bundles.insert(bundle.bundle_id, bundle.clone());

        if let Err(e) = self.persist_bundles().await {
            self.bundles.remove(&bundle.bundle_id);
            self.rollback_virtual_deduction(&bundle).await;
            warn!(request_id = %request_id, error = %e, "bind persist failed, rolled back");
            return GroupResponse { success: false, id, message: format!("bind persist failed: {e}") };
        }

        if let Some(agent_unit) = self.resource_view.get_unit(bundle.owning_agent_id.to_hex()).await {
            if let Err(e) = self.apply_bound_shape(&agent_unit, &bundle).await {
                warn!(request_id = %request_id, error = %e, "failed to refresh resource view after bind");
            }
        }

        GroupResponse { success: true, id, message: "bound".into() }
    }

    async fn apply_bound_shape(&self, agent_unit: &ResourceUnit, bundle: &Bundle) -> Result<()> {
        let mut updated = agent_unit.clone();
        if let Some(fragment) = updated.fragment.get_mut(&bundle.bundle_id.to_hex()) {
            fragment.status = UnitStatus::Normal;
        }
        self.resource_view.update_unit(updated, UpdateType::Virtual).await
    }

    async fn unbind(&mut self, bundle_id: BundleId) -> GroupResponse {
        let id = bundle_id.to_hex();
        let Some(bundle) = self.bundles.remove(&bundle_id) else {
            return GroupResponse { success: false, id, message: "not found".into() };
        };

        if let Err(e) = self.persist_bundles().await {
            self.bundles.insert(bundle_id, bundle);
            warn!(%bundle_id, error = %e, "unbind persist failed, rolled back");
            return GroupResponse { success: false, id, message: format!("unbind persist failed: {e}") };
        }

        self.rollback_virtual_deduction(&bundle).await;
        GroupResponse { success: true, id, message: "unbound".into() }
    }

    async fn remove_bundle_internal(&mut self, bundle_id: BundleId) -> Result<()> {
        let Some(bundle) = self.bundles.remove(&bundle_id) else {
            return Ok(());
        };
        self.persist_bundles().await?;
        self.rollback_virtual_deduction(&bundle).await;
        Ok(())
    }

    async fn sync_bundles(&mut self, agent_id: AgentId) -> Result<()> {
        let blob = match self.store.get(&bundles_key(&self.node_id)).await {
            Ok(Some(entry)) => serde_json::from_slice::<BundlesBlob>(&entry.value).unwrap_or_default(),
            Ok(None) => BundlesBlob::default(),
            Err(e) => return Err(e.into()),
        };

        for bundle in blob.bundles.into_values().filter(|b| b.owning_agent_id == agent_id) {
            self.bundles.insert(bundle.bundle_id, bundle.clone());
            if let Some(agent_unit) = self.resource_view.get_unit(agent_id.to_hex()).await {
                let _ = self.apply_bound_shape(&agent_unit, &bundle).await;
            }
        }
        Ok(())
    }

    async fn sync_failed_bundles(&mut self, agent_map: &HashMap<AgentId, bool>) -> Result<()> {
        let dead: Vec<BundleId> = self
            .bundles
            .values()
            .filter(|b| !agent_map.get(&b.owning_agent_id).copied().unwrap_or(false))
            .map(|b| b.bundle_id)
            .collect();
        for bundle_id in dead {
            self.remove_bundle_internal(bundle_id).await?;
        }
        Ok(())
    }

    async fn notify_failed_agent(&mut self, agent_id: AgentId) -> Result<()> {
        let owned: Vec<BundleId> =
            self.bundles.values().filter(|b| b.owning_agent_id == agent_id).map(|b| b.bundle_id).collect();
        for bundle_id in &owned {
            if let Some(bundle) = self.bundles.get_mut(bundle_id) {
                bundle.status = BundleStatus::ToBeDelete;
            }
        }
        if !owned.is_empty() {
            self.persist_bundles().await?;
        }
        for bundle_id in owned {
            if let Some(bundle) = self.bundles.get(&bundle_id).cloned() {
                self.rollback_virtual_deduction(&bundle).await;
            }
        }
        Ok(())
    }

    async fn update_bundles_status(&mut self, agent_id: AgentId, status: UnitStatus) -> Result<()> {
        let new_status = match status {
            UnitStatus::Normal => BundleStatus::Normal,
            UnitStatus::Recovering => BundleStatus::Recovering,
            UnitStatus::Evicting => BundleStatus::Evicting,
        };
        let mut changed = false;
        for bundle in self.bundles.values_mut().filter(|b| b.owning_agent_id == agent_id) {
            bundle.status = new_status;
            changed = true;
        }
        if changed {
            self.persist_bundles().await?;
        }
        Ok(())
    }
}
