//! Instance Control (IC): owns every instance's lifecycle state machine on
//! this node — ordered admission across primary (concrete-capacity) and
//! virtual (bundle-backed) queues, dependency-gated deploy dispatch,
//! reschedule-on-recoverable-failure, forward-kill to non-co-located
//! instances, and the eviction/graceful-shutdown drains FAM drives through
//! the [`fnproxy_fam::InstanceSync`] hook.
//!
//! IC depends on FAM and BM directly — it calls `deploy_instance`/
//! `kill_instance` on the former and `reserve`/`bind`/`unreserve` on the
//! latter — and implements [`fnproxy_fam::InstanceSync`] for [`IcHandle`] so
//! FAM can call back into it without creating a crate-level cycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod actor;
mod control_plane_client;
mod dependencies;
mod scheduling;
mod types;

mod handle;

pub use control_plane_client::{ClientResult, ControlPlaneClient, HttpControlPlaneClient, NoopControlPlaneClient};
pub use dependencies::{AlwaysReadyResolver, DependencyResolver};
pub use handle::IcHandle;
pub use scheduling::{FirstFitPolicy, SchedulingPolicy};
pub use types::{AdmissionResponse, InstanceOutcome, InstanceStatus, KillRequest, KillResponse};
