//! Persisted and runtime types owned by FAM.

use std::collections::{HashMap, HashSet};

use fnproxy_core::{AgentId, InstanceId, ResourceUnit, RuntimeMgrId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// An agent's registration status.
///
/// Encoded as a tagged string (`serde(rename_all = "snake_case")`) rather than
/// a bare numeric discriminant: unlike the source's protobuf-JSON encoder,
/// `serde_json` does not silently drop a `0` field, so the "`Failed` must not
/// be the zero variant" workaround the source needed does not apply here. The
/// invariant is kept in spirit — `Failed` and `Evicted` are never the first
/// variant declared — purely so the two encodings stay easy to eyeball against
/// each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered and healthy.
    Success,
    /// Registration or a runtime-manager retry failed; must be re-registered by the operator.
    Failed,
    /// Mid-eviction; instances are being drained.
    Evicting,
    /// Eviction completed; no further RPCs will be sent to this agent.
    Evicted,
}

/// A single agent's persisted registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// The agent's identity.
    pub agent_id: AgentId,
    /// The agent's transport endpoint.
    pub agent_address: String,
    /// The agent's runtime-manager identity; stable across the agent's lifetime.
    pub runtime_mgr_id: RuntimeMgrId,
    /// Current registration status.
    pub status: AgentStatus,
    /// Set when `status` becomes `Evicting`; the upstream-provided grace period.
    pub evict_timeout_sec: Option<u64>,
}

/// This node's local scheduler status, persisted alongside the agent map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    /// Serving registrations and RPCs normally.
    Normal,
    /// Shutting down; no further registrations are accepted.
    Evicted,
}

/// The persisted blob at `/yr/agentInfo/<NodeId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfoBlob {
    /// Every agent this node knows about, by id.
    pub agents: HashMap<AgentId, AgentRegistration>,
    /// This node's own local status.
    pub local_status: LocalStatus,
}

impl Default for AgentInfoBlob {
    fn default() -> Self {
        Self { agents: HashMap::new(), local_status: LocalStatus::Normal }
    }
}

/// Runtime-only state for a registered agent; never persisted.
pub struct AgentRuntimeState {
    /// RPCs may only target an enabled agent (except a forced kill during recovery).
    pub enabled: bool,
    /// Whether the resource view has been populated for this agent.
    pub initialized: bool,
    /// Instances currently attributed to this agent.
    pub instance_ids: HashSet<InstanceId>,
    /// Fulfilled with `true`/`false` when this agent's recovery completes;
    /// every evict_agent call that arrived mid-recovery is chained onto these.
    pub recover_waiters: Vec<oneshot::Sender<bool>>,
}

impl AgentRuntimeState {
    /// Construct fresh runtime state for a newly registered, not-yet-enabled agent.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            initialized: false,
            instance_ids: HashSet::new(),
            recover_waiters: Vec::new(),
        }
    }
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Request payload for `register`.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// The agent's identity.
    pub agent_id: AgentId,
    /// The agent's transport endpoint.
    pub agent_address: String,
    /// The agent's runtime-manager identity.
    pub runtime_mgr_id: RuntimeMgrId,
    /// Initial reported capacity, used to seed the resource view.
    pub initial_unit: ResourceUnit,
}

/// Response payload for `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredResponse {
    /// Whether registration succeeded.
    pub outcome: RegisterOutcome,
    /// A human-readable explanation.
    pub message: String,
}

impl Default for RegisteredResponse {
    /// Used only as the fallback when the FAM actor's mailbox is gone.
    fn default() -> Self {
        Self { outcome: RegisterOutcome::Failed, message: "FAM actor unavailable".into() }
    }
}

/// The outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Registered (or already registered, idempotently).
    Success,
    /// The payload was malformed.
    ParameterError,
    /// The same `(agent_id, runtime_mgr_id)` was previously marked `Failed`.
    Failed,
    /// The same `(agent_id, runtime_mgr_id)` was previously marked `Evicted`.
    AgentEvicted,
}

/// Request payload for `evict_agent`.
#[derive(Debug, Clone)]
pub struct EvictAgentRequest {
    /// The agent to evict.
    pub agent_id: AgentId,
    /// Grace period, in seconds, granted to in-flight instances.
    pub timeout_sec: u64,
}

/// Agent-reported self-status codes that drive `UpdateAgentStatus`.
///
/// The source's switch on `UpdateAgentStatusRequest::status` falls through
/// from both of these into one unconditional cleanup; every other code in
/// the source (`VPC_PROBE_FAILED`, `DISK_USAGE_EXCEED_LIMIT`, ...) is out of
/// this core's scope (spec.md names only these two).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExitStatus {
    /// The agent process exited.
    FuncAgentExited,
    /// The agent's runtime manager failed to register.
    RuntimeManagerRegisterFailed,
}

/// Response payload notified upstream once an eviction resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictResult {
    /// The agent the result concerns.
    pub agent_id: AgentId,
    /// Whether the eviction succeeded.
    pub success: bool,
    /// A human-readable explanation.
    pub message: String,
}
