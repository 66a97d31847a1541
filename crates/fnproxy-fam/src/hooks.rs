//! The callback traits FAM uses to reach IC and BM.
//!
//! The component table has FAM depend only on R, H, and M; IC and BM instead
//! depend on FAM. To let FAM still call into IC (sync instances, fail
//! instances by agent) and BM (sync bundles, notify a failed agent) without a
//! crate-level cycle, FAM defines these as traits and holds each behind a
//! [`fnproxy_core::Deferred`] slot. `fnproxy-ic`/`fnproxy-bm` implement the
//! traits for their own handles; whatever wires the system together binds the
//! slots once every actor exists.

use async_trait::async_trait;
use fnproxy_core::{AgentId, InstanceId, Result, UnitStatus};

/// The IC-side hooks FAM calls during registration, recovery, eviction, and
/// heartbeat loss.
#[async_trait]
pub trait InstanceSync: Send + Sync {
    /// Re-register an agent's instances into IC's tables (called from `register`/recovery).
    async fn sync_instances(&self, agent_id: AgentId) -> Result<()>;

    /// Drive every instance on `agent_id` into a `Failed` status (heartbeat loss).
    async fn put_failed_instance_status_by_agent_id(&self, agent_id: AgentId) -> Result<()>;

    /// Forward an agent-reported status transition for `instance_id` into IC's
    /// state machine.
    async fn update_instance_status(&self, instance_id: InstanceId, status: serde_json::Value) -> Result<()>;

    /// Drain every instance on `agent_id` as part of the eviction protocol's phase 2;
    /// resolves once every instance has been accounted for.
    async fn evict_instance_on_agent(&self, agent_id: AgentId, timeout_sec: u64) -> Result<()>;
}

/// The BM-side hooks FAM calls during registration, recovery, eviction, and
/// heartbeat loss.
#[async_trait]
pub trait BundleSync: Send + Sync {
    /// Re-register an agent's bundles into BM's tables (called from `register`/recovery).
    async fn sync_bundles(&self, agent_id: AgentId) -> Result<()>;

    /// Mark every bundle owned by `agent_id` as failed and remove it from the resource view.
    async fn notify_failed_agent(&self, agent_id: AgentId) -> Result<()>;

    /// Propagate an agent's resource-unit status down to all of its bundles.
    async fn update_bundles_status(&self, agent_id: AgentId, status: UnitStatus) -> Result<()>;
}
