//! The pluggable client BM uses to delegate allocation decisions to the
//! upstream Scheduler decision engine.
//!
//! Mirrors the shape of an agent-lifecycle scheduler client: one trait with a
//! decide/release pair, an HTTP implementation, and a no-op implementation for
//! tests and for deployments with no external decision engine configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ScheduleRequest, ScheduleResult};

/// A result type for scheduler-client calls: `Err` means the RPC did not land
/// (timeout, connection refused); a substantive rejection from the scheduler
/// (no capacity, policy denial) is still `Ok` with a reason code.
pub type ClientResult<T> = std::result::Result<T, String>;

/// The decision engine's verdict on a single reservation request.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The request was granted.
    Granted(ScheduleResult),
    /// The request was denied; carries the scheduler's reason code.
    Denied(String),
}

/// The RPC surface BM drives against the upstream Scheduler decision engine.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Ask the decision engine to allocate resources for `req`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the request could not be delivered at all.
    async fn decide(&self, req: &ScheduleRequest, timeout: Duration) -> ClientResult<Decision>;

    /// Release a previously granted decision, e.g. after an UnReserve or a reserve
    /// timeout. Best-effort: the decision engine is expected to also self-expire
    /// unreleased grants on its own timer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the RPC did not land.
    async fn release(&self, binding_token: &str, timeout: Duration) -> ClientResult<()>;
}

#[derive(Debug, Serialize)]
struct DecideRequest<'a> {
    request_id: String,
    instance_id: String,
    resource_spec: &'a std::collections::HashMap<String, f64>,
    labels: &'a std::collections::HashMap<String, String>,
    resource_group_ref: &'a str,
    affinity: Option<&'a str>,
    priority: i32,
    trace_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum DecideResponse {
    Granted {
        agent_id: String,
        allocated: std::collections::HashMap<String, f64>,
        binding_token: String,
    },
    Denied {
        reason: String,
    },
}

/// HTTP client for the Scheduler decision engine's REST API.
#[derive(Debug, Clone)]
pub struct HttpSchedulerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchedulerClient {
    /// Create a new scheduler client against `base_url` (e.g. `"http://scheduler:8080"`).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn decide(&self, req: &ScheduleRequest, timeout: Duration) -> ClientResult<Decision> {
        let body = DecideRequest {
            request_id: req.request_id.to_hex(),
            instance_id: req.instance_id.to_hex(),
            resource_spec: &req.resource_spec,
            labels: &req.labels,
            resource_group_ref: &req.resource_group_ref,
            affinity: req.affinity.as_deref(),
            priority: req.priority,
            trace_id: &req.trace_id,
        };

        let response = self
            .client
            .post(format!("{}/v1/schedule", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let parsed: DecideResponse = response.json().await.map_err(|e| e.to_string())?;
        match parsed {
            DecideResponse::Granted { agent_id, allocated, binding_token } => {
                let agent_id = fnproxy_core::AgentId::from_hex(&agent_id).map_err(|e| e.to_string())?;
                Ok(Decision::Granted(ScheduleResult { agent_id, allocated, binding_token }))
            }
            DecideResponse::Denied { reason } => Ok(Decision::Denied(reason)),
        }
    }

    async fn release(&self, binding_token: &str, timeout: Duration) -> ClientResult<()> {
        self.client
            .delete(format!("{}/v1/schedule/{binding_token}", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// A no-op scheduler client: grants every request against the agent named in
/// the request's labels (`"agent_id"`), or denies if that label is absent.
/// Useful for single-agent deployments with no external decision engine and
/// for tests.
#[derive(Debug, Clone, Default)]
pub struct NoopSchedulerClient;

#[async_trait]
impl SchedulerClient for NoopSchedulerClient {
    async fn decide(&self, req: &ScheduleRequest, _timeout: Duration) -> ClientResult<Decision> {
        tracing::warn!(
            request_id = %req.request_id,
            "NoopSchedulerClient: decide called but no scheduler configured"
        );
        let Some(agent_id_hex) = req.labels.get("agent_id") else {
            return Ok(Decision::Denied("no scheduler configured and no agent_id label".into()));
        };
        let agent_id = fnproxy_core::AgentId::from_hex(agent_id_hex).map_err(|e| e.to_string())?;
        Ok(Decision::Granted(ScheduleResult {
            agent_id,
            allocated: req.resource_spec.clone(),
            binding_token: req.request_id.to_hex(),
        }))
    }

    async fn release(&self, _binding_token: &str, _timeout: Duration) -> ClientResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_creation() {
        let client = HttpSchedulerClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
