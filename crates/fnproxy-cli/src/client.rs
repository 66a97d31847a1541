//! HTTP client for a `fnproxy-service` node's read-only ops surface.

use fnproxy_core::ResourceUnit;
use fnproxy_fam::AgentRegistration;
use reqwest::Client;
use serde::Deserialize;

/// Error type for ops-client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP request itself failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The node reported a non-success status.
    #[error("node returned {status}: {body}")]
    Node {
        /// The HTTP status code.
        status: u16,
        /// The response body, for operator diagnosis.
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct AgentsResponse {
    agents: Vec<AgentRegistration>,
}

#[derive(Debug, Deserialize)]
struct ResourcesResponse {
    units: Vec<ResourceUnit>,
}

/// Thin client for a single node's `/v1/*` ops endpoints.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: Client,
    base_url: String,
}

impl NodeClient {
    /// Build a client against a node's base URL, e.g. `http://127.0.0.1:8080`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: Client::new(), base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    /// List every agent registration the node currently holds.
    pub async fn agents(&self) -> Result<Vec<AgentRegistration>, ClientError> {
        let response = self.http.get(format!("{}/v1/agents", self.base_url)).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json::<AgentsResponse>().await?.agents)
    }

    /// Fetch the node's current resource view.
    pub async fn resources(&self) -> Result<Vec<ResourceUnit>, ClientError> {
        let response = self.http.get(format!("{}/v1/resources", self.base_url)).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json::<ResourcesResponse>().await?.units)
    }

    /// Trigger a graceful shutdown: drain admission, then evict every agent.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let response = self.http.post(format!("{}/v1/shutdown", self.base_url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Node { status, body })
    }
}
