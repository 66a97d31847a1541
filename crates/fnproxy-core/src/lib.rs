//! Core types shared by every local-scheduler component.
//!
//! - **Identifiers**: opaque, byte-exact ids for nodes, agents, instances, bundles,
//!   requests, and runtime managers.
//! - **Errors**: the [`ProxyError`] taxonomy every component boundary surfaces.
//! - **Resource tree**: the [`resource::ResourceUnit`] shape owned by the Resource View.
//!
//! # Example
//!
//! ```
//! use fnproxy_core::{AgentId, RuntimeMgrId};
//!
//! let rm = RuntimeMgrId::generate();
//! let agent_id = AgentId::generate("127.0.0.1:5001", &rm);
//! let again = AgentId::generate("127.0.0.1:5001", &rm);
//! assert_eq!(agent_id, again, "re-registration of the same (address, runtime_mgr) resolves to the same AgentId");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod ids;
pub mod registry;
pub mod resource;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use ids::{AgentId, BundleId, IdError, InstanceId, NodeId, RequestId, RuntimeMgrId};
pub use registry::Deferred;
pub use resource::{ResourceUnit, UnitStatus, UpdateType};
