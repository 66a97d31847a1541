//! Wire message types for the operations named in the governing spec's
//! external-interfaces section that have no direct counterpart already
//! exposed by FAM/BM/IC (`Register`, `Schedule`, `EvictAgent`, and
//! `GracefulShutdown` reuse those crates' own request/response types
//! directly — see [`crate::service`]).

use fnproxy_core::{AgentId, InstanceId};
use serde::{Deserialize, Serialize};

/// `UnRegister`: administratively remove an agent that never went through
/// the heartbeat-loss or operator-initiated eviction paths. Routed to the
/// same eviction protocol FAM already runs for `EvictAgent`, with a zero
/// grace period, since there is no separate "hard remove" primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnRegisterRequest {
    /// The agent to remove.
    pub agent_id: AgentId,
}

/// `UpdateSchedTopoView`: the upstream (domain/global) scheduler's view of
/// cluster topology. Nothing in FAM/BM/IC's correctness depends on this —
/// it is accepted and logged purely as informational context, the same
/// "thin collaborator" treatment the governing spec gives leader election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSchedTopoViewRequest {
    /// Opaque topology payload; this core does not interpret its shape.
    pub view: serde_json::Value,
}

/// `TryCancelSchedule`: withdraw an admitted-but-not-yet-running instance.
/// Routed to IC's `kill`, which already handles cancel-before-dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryCancelScheduleRequest {
    /// The instance whose admission should be withdrawn.
    pub instance_id: InstanceId,
}

/// `QueryAgentInfo`: no body; the caller wants every agent this node knows about.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryAgentInfoRequest;

/// `QueryResourcesInfo`: no body; the caller wants the current resource view.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryResourcesInfoRequest;

/// `GracefulShutdown`: no body; drains IC then FAM.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GracefulShutdownRequest;

/// `ResponseQueryAgentInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseQueryAgentInfo {
    /// Every agent registration this node currently holds.
    pub agents: Vec<fnproxy_fam::AgentRegistration>,
}

/// `ResponseQueryResourcesInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseQueryResourcesInfo {
    /// The current resource view, flattened to its top-level units.
    pub units: Vec<fnproxy_core::ResourceUnit>,
}

/// `NotifySchedAbnormal`: pushed asynchronously when an admitted instance
/// settles into a terminal failure instead of reaching `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySchedAbnormal {
    /// The instance that failed.
    pub instance_id: InstanceId,
    /// A human-readable explanation.
    pub message: String,
}

/// `EvictAgentAck`: the immediate acknowledgement that an eviction was
/// accepted and entered `Evicting`; the eventual outcome arrives later as a
/// `NotifyEvictResult` (see [`fnproxy_fam::EvictResult`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictAgentAck {
    /// Whether the eviction was accepted and started.
    pub accepted: bool,
    /// A human-readable explanation.
    pub message: String,
}
