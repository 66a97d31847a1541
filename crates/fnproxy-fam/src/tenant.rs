//! Tenant-affinity advisory cache and policy hooks.
//!
//! Purely in-memory and purely advisory: it never gates scheduling. FAM
//! maintains `tenant_id -> {pod_ips, per-agent instance set}` and fires one of
//! five policy callbacks as instances come and go, toggled by
//! `enable_tenant_affinity`. A caller that wants real behavior (e.g. a
//! network-isolation controller) implements [`TenantAffinityPolicy`]; the
//! default is a no-op observer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use fnproxy_core::{AgentId, InstanceId};

/// An instance's tenant-relevant placement, as reported by `tenant_update_instance`.
#[derive(Debug, Clone)]
pub struct TenantInstanceEvent {
    /// The owning tenant, an opaque label.
    pub tenant_id: String,
    /// The instance placed or removed.
    pub instance_id: InstanceId,
    /// The agent it landed on (or is being removed from).
    pub agent_id: AgentId,
    /// The agent's pod IP, if known.
    pub pod_ip: Option<String>,
    /// Whether this is the tenant's first instance on this node.
    pub is_first_on_node: bool,
    /// Whether the agent's pod is newly created for this placement.
    pub is_new_pod: bool,
}

/// The five policy hooks the cache fires; all default to no-ops.
#[async_trait]
pub trait TenantAffinityPolicy: Send + Sync {
    /// A tenant's first instance landed on an agent pod already resident on this node.
    async fn on_tenant_first_instance_sched_in_local_pod(&self, _event: &TenantInstanceEvent) {}

    /// A tenant's first instance landed on an agent pod resident on a different node.
    async fn on_tenant_first_instance_sched_in_remote_pod(&self, _event: &TenantInstanceEvent) {}

    /// A tenant's first instance landed on a newly created pod.
    async fn on_tenant_first_instance_sched_in_new_pod(&self, _event: &TenantInstanceEvent) {}

    /// One of a tenant's instances was deleted from a pod.
    async fn on_tenant_instance_in_pod_deleted(&self, _event: &TenantInstanceEvent) {}

    /// All of a tenant's instances on a given pod have been deleted.
    ///
    /// `pod_reuse_window_sec` is the configured grace period during which
    /// the pod may still be worth keeping warm for the same tenant rather
    /// than torn down; this cache never acts on it itself.
    async fn on_tenant_all_deleted(&self, _tenant_id: &str, _agent_id: AgentId, _pod_reuse_window_sec: u64) {}
}

/// A policy that observes every event but takes no action.
#[derive(Default)]
pub struct NoopTenantAffinityPolicy;

impl TenantAffinityPolicy for NoopTenantAffinityPolicy {}

#[derive(Default, Clone)]
struct TenantRecord {
    pod_ips: HashSet<String>,
    instances_by_agent: HashMap<AgentId, HashSet<InstanceId>>,
}

/// The in-memory tenant-affinity cache.
pub struct TenantAffinityCache {
    tenants: HashMap<String, TenantRecord>,
}

impl Default for TenantAffinityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantAffinityCache {
    /// Construct an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self { tenants: HashMap::new() }
    }

    /// Record a tenant instance placement, firing the matching policy hook.
    pub async fn update_instance(&mut self, event: TenantInstanceEvent, policy: &dyn TenantAffinityPolicy) {
        let record = self.tenants.entry(event.tenant_id.clone()).or_default();
        if let Some(ip) = &event.pod_ip {
            record.pod_ips.insert(ip.clone());
        }
        let is_first_for_tenant = record.instances_by_agent.is_empty();
        record.instances_by_agent.entry(event.agent_id).or_default().insert(event.instance_id);

        if is_first_for_tenant || event.is_first_on_node {
            if event.is_new_pod {
                policy.on_tenant_first_instance_sched_in_new_pod(&event).await;
            } else if event.is_first_on_node {
                policy.on_tenant_first_instance_sched_in_local_pod(&event).await;
            } else {
                policy.on_tenant_first_instance_sched_in_remote_pod(&event).await;
            }
        }
    }

    /// Remove a tenant instance, firing the matching policy hooks.
    pub async fn delete_instance(
        &mut self,
        event: TenantInstanceEvent,
        policy: &dyn TenantAffinityPolicy,
        pod_reuse_window_sec: u64,
    ) {
        let Some(record) = self.tenants.get_mut(&event.tenant_id) else { return };
        if let Some(instances) = record.instances_by_agent.get_mut(&event.agent_id) {
            instances.remove(&event.instance_id);
            policy.on_tenant_instance_in_pod_deleted(&event).await;
            if instances.is_empty() {
                record.instances_by_agent.remove(&event.agent_id);
                policy.on_tenant_all_deleted(&event.tenant_id, event.agent_id, pod_reuse_window_sec).await;
            }
        }
        if record.instances_by_agent.is_empty() {
            self.tenants.remove(&event.tenant_id);
        }
    }

    /// Drop every tenant's tracking of `agent_id` at once, firing
    /// `on_tenant_all_deleted` for each tenant that had instances there.
    ///
    /// Called when an agent is torn down outright (exit, forced cleanup)
    /// rather than one instance at a time.
    pub async fn clear_agent(&mut self, agent_id: AgentId, policy: &dyn TenantAffinityPolicy, pod_reuse_window_sec: u64) {
        let mut emptied = Vec::new();
        for (tenant_id, record) in &mut self.tenants {
            if record.instances_by_agent.remove(&agent_id).is_some() {
                emptied.push(tenant_id.clone());
            }
        }
        for tenant_id in emptied {
            policy.on_tenant_all_deleted(&tenant_id, agent_id, pod_reuse_window_sec).await;
            if self.tenants.get(&tenant_id).is_some_and(|r| r.instances_by_agent.is_empty()) {
                self.tenants.remove(&tenant_id);
            }
        }
    }

    /// Current instance count for a tenant, for diagnostics/tests.
    #[must_use]
    pub fn instance_count(&self, tenant_id: &str) -> usize {
        self.tenants
            .get(tenant_id)
            .map(|r| r.instances_by_agent.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPolicy {
        new_pod_calls: AtomicUsize,
        deleted_calls: AtomicUsize,
        all_deleted_calls: AtomicUsize,
    }

    #[async_trait]
    impl TenantAffinityPolicy for CountingPolicy {
        async fn on_tenant_first_instance_sched_in_new_pod(&self, _event: &TenantInstanceEvent) {
            self.new_pod_calls.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_tenant_instance_in_pod_deleted(&self, _event: &TenantInstanceEvent) {
            self.deleted_calls.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_tenant_all_deleted(&self, _tenant_id: &str, _agent_id: AgentId, _pod_reuse_window_sec: u64) {
            self.all_deleted_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event(agent: u8) -> TenantInstanceEvent {
        TenantInstanceEvent {
            tenant_id: "tenant-a".into(),
            instance_id: InstanceId::from_bytes([1u8; 32]),
            agent_id: AgentId::from_bytes([agent; 32]),
            pod_ip: Some("10.0.0.1".into()),
            is_first_on_node: true,
            is_new_pod: true,
        }
    }

    #[tokio::test]
    async fn first_instance_on_new_pod_fires_once() {
        let mut cache = TenantAffinityCache::new();
        let policy = CountingPolicy::default();
        cache.update_instance(event(1), &policy).await;
        assert_eq!(policy.new_pod_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.instance_count("tenant-a"), 1);
    }

    #[tokio::test]
    async fn delete_last_instance_fires_all_deleted() {
        let mut cache = TenantAffinityCache::new();
        let policy = CountingPolicy::default();
        cache.update_instance(event(1), &policy).await;
        cache.delete_instance(event(1), &policy, 300).await;
        assert_eq!(policy.deleted_calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.all_deleted_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.instance_count("tenant-a"), 0);
    }

    #[tokio::test]
    async fn clear_agent_fires_all_deleted_for_every_tenant_on_it() {
        let mut cache = TenantAffinityCache::new();
        let policy = CountingPolicy::default();
        cache.update_instance(event(1), &policy).await;
        cache
            .update_instance(
                TenantInstanceEvent { tenant_id: "tenant-b".into(), ..event(1) },
                &policy,
            )
            .await;
        cache.clear_agent(AgentId::from_bytes([1u8; 32]), &policy, 300).await;
        assert_eq!(policy.all_deleted_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.instance_count("tenant-a"), 0);
        assert_eq!(cache.instance_count("tenant-b"), 0);
    }
}
