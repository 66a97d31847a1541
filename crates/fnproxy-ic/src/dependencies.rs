//! Pluggable dependency gate for admission: "Instance deploy is withheld
//! until a configurable set of upstream objects/instances are `Ready`;
//! otherwise the instance transitions to `Failed` with a dependency error."
//! This core carries no object store or upstream instance registry of its
//! own, so the only resolver provided here is the default that considers
//! every request ready; a real deployment supplies its own.

use async_trait::async_trait;
use fnproxy_bm::ScheduleRequest;

/// Decides whether a request's declared dependencies are satisfied.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Returns `Ok(())` if every dependency is `Ready`, or `Err(reason)` otherwise.
    async fn check(&self, req: &ScheduleRequest) -> Result<(), String>;
}

/// The default resolver: every request is immediately ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReadyResolver;

#[async_trait]
impl DependencyResolver for AlwaysReadyResolver {
    async fn check(&self, _req: &ScheduleRequest) -> Result<(), String> {
        Ok(())
    }
}
