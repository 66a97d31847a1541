//! Persisted and runtime types owned by BM.

use std::collections::HashMap;

use fnproxy_core::{AgentId, BundleId, InstanceId, RequestId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Bundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    /// Bound and healthy.
    Normal,
    /// Owning agent is mid-recovery; bundle is not yet known-good.
    Recovering,
    /// Mid-eviction; no further work should target this bundle.
    Evicting,
    /// Marked for removal; swept on the next GC pass.
    ToBeDelete,
}

/// A bound, persisted resource reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Identity of this bundle.
    pub bundle_id: BundleId,
    /// The agent this bundle's resources were carved out of.
    pub owning_agent_id: AgentId,
    /// The resource group this bundle belongs to.
    pub resource_group_name: String,
    /// This bundle's index within its resource group.
    pub bundle_index: u32,
    /// Resources held by this bundle, per kind.
    pub resources: HashMap<String, f64>,
    /// Current lifecycle status.
    pub status: BundleStatus,
    /// Unix-epoch seconds after which an unbound reservation is released; `None` once bound.
    pub reserved_until: Option<u64>,
}

/// The persisted blob at `/yr/bundles/<NodeId>`: every bundle this node owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlesBlob {
    /// Every bundle this node knows about, by id.
    pub bundles: HashMap<BundleId, Bundle>,
}

impl Default for BundlesBlob {
    fn default() -> Self {
        Self { bundles: HashMap::new() }
    }
}

/// A request to reserve resources for one instance within a resource group.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Correlates this reservation across Reserve/Bind/UnReserve.
    pub request_id: RequestId,
    /// The instance this reservation is for.
    pub instance_id: InstanceId,
    /// Requested resources, per kind.
    pub resource_spec: HashMap<String, f64>,
    /// Opaque scheduling labels, passed through to the scheduler decision engine.
    pub labels: HashMap<String, String>,
    /// The resource group this request belongs to.
    pub resource_group_ref: String,
    /// Opaque affinity hints, passed through to the scheduler decision engine.
    pub affinity: Option<String>,
    /// Scheduling priority; higher values are considered first by the decision engine.
    pub priority: i32,
    /// Propagated for cross-component tracing.
    pub trace_id: String,
}

/// The decision engine's allocation result for a single `ScheduleRequest`.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    /// The agent chosen to host this bundle.
    pub agent_id: AgentId,
    /// Resources actually allocated, per kind; may be a subset of what was requested.
    pub allocated: HashMap<String, f64>,
    /// Opaque token the scheduler expects back on Bind.
    pub binding_token: String,
}

/// In-memory-only bookkeeping for a reservation that has not yet been bound.
pub struct ReservedContext {
    /// The decision the scheduler made for this reservation.
    pub schedule_result: ScheduleResult,
    /// Handle to the armed `reserve_expire_timer`; aborted on Bind/UnReserve.
    pub reserve_expire_timer: tokio::task::JoinHandle<()>,
    /// The bundle shape this reservation will promote to on Bind.
    pub bundle: Bundle,
    /// The resource group name this reservation was made under.
    pub resource_group_name: String,
}

/// Response to `reserve`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResponse {
    /// Whether the reservation succeeded.
    pub success: bool,
    /// The request this responds to.
    pub request_id: RequestId,
    /// The agent the scheduler granted this reservation against, if successful.
    pub agent_id: Option<AgentId>,
    /// A human-readable explanation; carries the scheduler's reason code on failure.
    pub message: String,
}

/// Response to `bind`/`unbind`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Hex-encoded id this responds to: a `RequestId` for `bind`, a `BundleId` for `unbind`.
    pub id: String,
    /// A human-readable explanation.
    pub message: String,
}

impl Default for ScheduleResponse {
    /// Used only as the fallback when the BM actor's mailbox is gone.
    fn default() -> Self {
        Self {
            success: false,
            request_id: RequestId::generate(),
            agent_id: None,
            message: "BM actor unavailable".into(),
        }
    }
}

impl Default for GroupResponse {
    /// Used only as the fallback when the BM actor's mailbox is gone.
    fn default() -> Self {
        Self { success: false, id: String::new(), message: "BM actor unavailable".into() }
    }
}
