//! Runtime-only types owned by IC. None of this is persisted: the data model
//! names `AgentRegistration`/`Bundle` as the only persisted entities, and an
//! `Instance`'s authoritative state lives with the agent that runs it.

use std::cmp::Ordering;

use fnproxy_core::{AgentId, InstanceId};
use fnproxy_bm::ScheduleRequest;
use tokio::sync::oneshot;

/// One instance's lifecycle phase, per the state machine in the governing spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Admitted, not yet picked off a queue.
    Pending,
    /// Queued; awaiting a scheduling decision (primary agent pick or BM reserve).
    Scheduling,
    /// A decision has been made; deploy has been dispatched to the agent.
    Creating,
    /// The agent acknowledged a successful deploy.
    Running,
    /// A deploy failed or the owning agent was lost, in a class judged retryable.
    Recoverable,
    /// Terminal failure: no-such-function, non-recoverable deploy failure, retry budget exhausted.
    Failed,
    /// A kill or agent eviction is draining this instance.
    Evicting,
    /// The evict protocol completed.
    Evicted,
    /// A graceful or forced kill completed.
    Killed,
}

impl InstanceStatus {
    /// Whether this status is a final resting state; no further transition is expected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Evicted | Self::Killed)
    }
}

/// The final outcome delivered to a ready callback.
#[derive(Debug, Clone)]
pub enum InstanceOutcome {
    /// The instance reached `Running` on the named agent.
    Running {
        /// The agent hosting this instance.
        agent_id: AgentId,
    },
    /// The instance reached a terminal, non-running status.
    Terminal {
        /// The status it settled in (`Failed`, `Evicted`, or `Killed`).
        status: InstanceStatus,
        /// A human-readable explanation.
        message: String,
    },
}

/// One admitted instance and everything IC tracks about it.
pub struct Instance {
    /// Identity of this instance.
    pub instance_id: InstanceId,
    /// Current lifecycle phase.
    pub status: InstanceStatus,
    /// The admission-ordering sequence number assigned at `schedule`.
    pub seq: u64,
    /// The original request this instance was admitted under.
    pub request: ScheduleRequest,
    /// The agent currently hosting this instance, once scheduled.
    pub agent_id: Option<AgentId>,
    /// Retries already attempted via `RescheduleAfterJudgeRecoverable`.
    pub retry_count: u32,
    /// Fired exactly once, on the `Running` transition or a terminal failure.
    pub ready_waiters: Vec<oneshot::Sender<InstanceOutcome>>,
}

impl Instance {
    /// Fulfil every registered ready-waiter with `outcome`, leaving none behind.
    pub fn notify_ready_waiters(&mut self, outcome: &InstanceOutcome) {
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// One entry in a priority admission queue: higher `priority` is served
/// first; ties are broken FIFO by `seq` (lower `seq` first).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AdmissionEntry {
    /// Caller-supplied priority; higher values are served first.
    pub priority: i32,
    /// Monotonic admission order, used to break priority ties FIFO.
    pub seq: u64,
    /// The instance this entry admits.
    pub instance_id: InstanceId,
}

impl Ord for AdmissionEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for AdmissionEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A request to terminate an instance.
#[derive(Debug, Clone)]
pub struct KillRequest {
    /// Correlates this call with its eventual response; also used for ordering
    /// (a late response for a superseded `request_id` is discarded).
    pub request_id: fnproxy_core::RequestId,
    /// The instance to kill.
    pub instance_id: InstanceId,
    /// Whether this is a forced (non-graceful) kill.
    pub force: bool,
}

/// Response to `kill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillResponse {
    /// Whether the kill succeeded (or the instance was already gone).
    pub success: bool,
    /// A human-readable explanation.
    pub message: String,
}

impl Default for KillResponse {
    /// Used only as the fallback when the IC actor's mailbox is gone.
    fn default() -> Self {
        Self { success: false, message: "IC actor unavailable".into() }
    }
}

/// Response to `schedule`: admission only, not the eventual running/failure outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResponse {
    /// Whether the request was admitted into a scheduling queue.
    pub success: bool,
    /// A human-readable explanation; carries the rejection reason on failure.
    pub message: String,
}

impl Default for AdmissionResponse {
    /// Used only as the fallback when the IC actor's mailbox is gone.
    fn default() -> Self {
        Self { success: false, message: "IC actor unavailable".into() }
    }
}
