//! The pluggable client FAM uses to talk to a function agent's RPC surface.
//!
//! Mirrors the source's per-call-type RPC surface (`DeployInstance`,
//! `KillInstance`, `QueryInstanceStatusInfo`, `UpdateCred`, `CleanStatus`,
//! `QueryDebugInstanceInfos`) as one trait, with an HTTP implementation and a
//! no-op implementation for tests.

use std::time::Duration;

use async_trait::async_trait;
use fnproxy_core::{InstanceId, RequestId, RuntimeMgrId};
use serde::{Deserialize, Serialize};

/// A result type for agent-client calls: `Err` means the RPC did not land
/// (timeout, connection refused); a substantive rejection from the agent is
/// still `Ok` with a failing response body.
pub type ClientResult<T> = std::result::Result<T, String>;

/// Payload for `DeployInstance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployInstanceRequest {
    /// Correlates this call with its eventual response.
    pub request_id: RequestId,
    /// The instance to deploy.
    pub instance_id: InstanceId,
    /// Opaque deploy spec (function code ref, resource request, env), passed through verbatim.
    pub spec: serde_json::Value,
}

/// Response to `DeployInstance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployInstanceResponse {
    /// Whether the deploy succeeded.
    pub success: bool,
    /// A human-readable explanation.
    pub message: String,
}

/// Payload for `KillInstance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillInstanceRequest {
    /// Correlates this call with its eventual response.
    pub request_id: RequestId,
    /// The instance to kill.
    pub instance_id: InstanceId,
    /// Whether this is a forced (non-graceful) kill.
    pub force: bool,
    /// Whether the target agent is an exclusive-agent pod: a successful kill
    /// against a monopoly agent also disconnects it.
    pub is_monopoly: bool,
}

/// Response to `KillInstance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillInstanceResponse {
    /// Whether the kill succeeded.
    pub success: bool,
    /// A human-readable explanation.
    pub message: String,
}

/// Response to `QueryInstanceStatusInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusInfo {
    /// The instance queried.
    pub instance_id: InstanceId,
    /// Opaque status payload as reported by the agent.
    pub status: serde_json::Value,
}

/// Response to `UpdateCred`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCredResponse {
    /// Whether the credential update succeeded.
    pub success: bool,
}

/// Response to `CleanStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanStatusResponse {
    /// Whether the agent acknowledged the clean-status request.
    pub acknowledged: bool,
}

/// The RPC surface FAM drives against one agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Dispatch a deploy RPC; a single attempt, retried by the caller.
    async fn deploy_instance(
        &self,
        address: &str,
        req: &DeployInstanceRequest,
        timeout: Duration,
    ) -> ClientResult<DeployInstanceResponse>;

    /// Dispatch a kill RPC; a single attempt, retried by the caller.
    async fn kill_instance(
        &self,
        address: &str,
        req: &KillInstanceRequest,
        timeout: Duration,
    ) -> ClientResult<KillInstanceResponse>;

    /// Query an instance's status directly from its agent.
    async fn query_instance_status(
        &self,
        address: &str,
        instance_id: InstanceId,
        runtime_mgr_id: RuntimeMgrId,
        timeout: Duration,
    ) -> ClientResult<InstanceStatusInfo>;

    /// Push an updated credential to the agent.
    async fn update_cred(
        &self,
        address: &str,
        token: &str,
        timeout: Duration,
    ) -> ClientResult<UpdateCredResponse>;

    /// Best-effort notification that this node is cleaning up after the agent.
    async fn clean_status(&self, address: &str, timeout: Duration) -> ClientResult<CleanStatusResponse>;

    /// Fan out a debug-info query for a single instance.
    async fn query_debug_instance_info(
        &self,
        address: &str,
        instance_id: InstanceId,
        timeout: Duration,
    ) -> ClientResult<serde_json::Value>;
}

/// An `AgentClient` that talks JSON-over-HTTP to each agent's local endpoint.
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl HttpAgentClient {
    async fn post<Req: Serialize + Sync, Resp: for<'de> Deserialize<'de>>(
        &self,
        address: &str,
        path: &str,
        req: &Req,
        timeout: Duration,
    ) -> ClientResult<Resp> {
        self.http
            .post(format!("http://{address}{path}"))
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json::<Resp>()
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn deploy_instance(
        &self,
        address: &str,
        req: &DeployInstanceRequest,
        timeout: Duration,
    ) -> ClientResult<DeployInstanceResponse> {
        self.post(address, "/agent/deploy", req, timeout).await
    }

    async fn kill_instance(
        &self,
        address: &str,
        req: &KillInstanceRequest,
        timeout: Duration,
    ) -> ClientResult<KillInstanceResponse> {
        self.post(address, "/agent/kill", req, timeout).await
    }

    async fn query_instance_status(
        &self,
        address: &str,
        instance_id: InstanceId,
        runtime_mgr_id: RuntimeMgrId,
        timeout: Duration,
    ) -> ClientResult<InstanceStatusInfo> {
        #[derive(Serialize)]
        struct Req {
            instance_id: InstanceId,
            runtime_mgr_id: RuntimeMgrId,
        }
        self.post(address, "/agent/query-instance-status", &Req { instance_id, runtime_mgr_id }, timeout)
            .await
    }

    async fn update_cred(&self, address: &str, token: &str, timeout: Duration) -> ClientResult<UpdateCredResponse> {
        #[derive(Serialize)]
        struct Req<'a> {
            token: &'a str,
        }
        self.post(address, "/agent/update-cred", &Req { token }, timeout).await
    }

    async fn clean_status(&self, address: &str, timeout: Duration) -> ClientResult<CleanStatusResponse> {
        self.post(address, "/agent/clean-status", &serde_json::json!({}), timeout).await
    }

    async fn query_debug_instance_info(
        &self,
        address: &str,
        instance_id: InstanceId,
        timeout: Duration,
    ) -> ClientResult<serde_json::Value> {
        #[derive(Serialize)]
        struct Req {
            instance_id: InstanceId,
        }
        self.post(address, "/agent/debug-instance", &Req { instance_id }, timeout).await
    }
}

/// An `AgentClient` that never responds; useful for retry/timeout tests and as
/// a safe default before a real transport is wired in.
#[derive(Default)]
pub struct NoopAgentClient;

#[async_trait]
impl AgentClient for NoopAgentClient {
    async fn deploy_instance(
        &self,
        _address: &str,
        _req: &DeployInstanceRequest,
        _timeout: Duration,
    ) -> ClientResult<DeployInstanceResponse> {
        Err("no agent transport configured".into())
    }

    async fn kill_instance(
        &self,
        _address: &str,
        _req: &KillInstanceRequest,
        _timeout: Duration,
    ) -> ClientResult<KillInstanceResponse> {
        Err("no agent transport configured".into())
    }

    async fn query_instance_status(
        &self,
        _address: &str,
        _instance_id: InstanceId,
        _runtime_mgr_id: RuntimeMgrId,
        _timeout: Duration,
    ) -> ClientResult<InstanceStatusInfo> {
        Err("no agent transport configured".into())
    }

    async fn update_cred(&self, _address: &str, _token: &str, _timeout: Duration) -> ClientResult<UpdateCredResponse> {
        Err("no agent transport configured".into())
    }

    async fn clean_status(&self, _address: &str, _timeout: Duration) -> ClientResult<CleanStatusResponse> {
        Err("no agent transport configured".into())
    }

    async fn query_debug_instance_info(
        &self,
        _address: &str,
        _instance_id: InstanceId,
        _timeout: Duration,
    ) -> ClientResult<serde_json::Value> {
        Err("no agent transport configured".into())
    }
}
