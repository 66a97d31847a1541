//! Function-Agent Manager (FAM): owns the lifecycle of every function agent
//! registered on this node — registration, heartbeat-driven failure
//! detection, deploy/kill/query routing, credential rotation, graceful
//! eviction, and the tenant-affinity advisory cache.
//!
//! FAM's own crate-level dependencies are only the Resource View, the
//! Heartbeat Controller, and the metastore client; its calls into Instance
//! Control and the Bundle Manager are expressed as the [`hooks::InstanceSync`]
//! and [`hooks::BundleSync`] traits, bound into [`fnproxy_core::Deferred`]
//! slots once every component exists. This breaks what would otherwise be a
//! crate-level dependency cycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod actor;
mod agent_client;
mod correlator;
mod hooks;
mod tenant;
mod types;

mod handle;

pub use agent_client::{
    AgentClient, CleanStatusResponse, ClientResult, DeployInstanceRequest, DeployInstanceResponse, HttpAgentClient,
    InstanceStatusInfo, KillInstanceRequest, KillInstanceResponse, NoopAgentClient, UpdateCredResponse,
};
pub use handle::FamHandle;
pub use hooks::{BundleSync, InstanceSync};
pub use tenant::{NoopTenantAffinityPolicy, TenantAffinityCache, TenantAffinityPolicy, TenantInstanceEvent};
pub use types::{
    AgentExitStatus, AgentInfoBlob, AgentRegistration, AgentStatus, EvictAgentRequest, EvictResult, LocalStatus,
    RegisterOutcome, RegisterRequest, RegisteredResponse,
};
