//! Local-Scheduler Service (LSS): the thin upstream-facing façade that routes
//! the wire messages named in the governing spec's external-interfaces
//! section onto the already-built FAM/BM/IC actors, plus the process entry
//! point (`main.rs`) that wires R/H/L/M/FAM/BM/IC together and exposes the
//! ambient HTTP health surface.
//!
//! Mirrors the teacher's split between a business-logic trait/struct
//! (`ControlPlaneService` there, [`service::LssService`] here) and a binary
//! that only adds health/ready endpoints and process bootstrap around it —
//! the actual dispatch surface is a library API, exercised directly by
//! [`tokio::test`]s rather than threaded through an HTTP transport, since
//! the wire transport itself is out of this core's scope.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod service;
pub mod types;

pub use error::{LssError, Result};
pub use service::LssService;
