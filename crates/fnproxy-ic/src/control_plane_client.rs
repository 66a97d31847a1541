//! The pluggable client IC uses to forward a kill to the node actually
//! hosting the target instance, when the caller is not co-located with it.
//!
//! Same shape as BM's `SchedulerClient` and FAM's `AgentClient`: one trait,
//! an HTTP implementation, and a no-op implementation for single-node
//! deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use fnproxy_core::InstanceId;
use serde::{Deserialize, Serialize};

/// A result type for control-plane calls: `Err` means the RPC did not land.
pub type ClientResult<T> = std::result::Result<T, String>;

/// The RPC surface IC drives against a peer node's control plane to forward a kill.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Forward a kill for `instance_id` to whichever node actually hosts it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the RPC did not land.
    async fn forward_kill(&self, instance_id: InstanceId, force: bool, timeout: Duration) -> ClientResult<bool>;
}

#[derive(Debug, Serialize)]
struct ForwardKillRequest {
    instance_id: String,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ForwardKillResponse {
    success: bool,
}

/// HTTP client for a peer node's forward-kill endpoint.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlaneClient {
    /// Create a new control-plane client against `base_url` (e.g. `"http://node-2:8080"`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn forward_kill(&self, instance_id: InstanceId, force: bool, timeout: Duration) -> ClientResult<bool> {
        let body = ForwardKillRequest { instance_id: instance_id.to_hex(), force };
        let response = self
            .client
            .post(format!("{}/v1/forward-kill", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let parsed: ForwardKillResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(parsed.success)
    }
}

/// A `ControlPlaneClient` that always fails; the safe default for single-node
/// deployments with no peer control plane configured, and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopControlPlaneClient;

#[async_trait]
impl ControlPlaneClient for NoopControlPlaneClient {
    async fn forward_kill(&self, _instance_id: InstanceId, _force: bool, _timeout: Duration) -> ClientResult<bool> {
        Err("no control-plane transport configured".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_creation() {
        let client = HttpControlPlaneClient::new("http://localhost:9100");
        assert_eq!(client.base_url, "http://localhost:9100");
    }
}
