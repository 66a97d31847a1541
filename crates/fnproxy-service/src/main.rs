//! Local Scheduler (Function Proxy) - process entry point.
//!
//! Wires R/H/L/M/FAM/BM/IC together against a single-node in-memory
//! metastore, resolves FAM's/BM's dependency-cycle-breaking `Deferred`
//! slots, and serves `/health`/`/ready` over HTTP, mirroring the teacher's
//! `aura-swarm-control` binary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::{get, post}, Json, Router};
use fnproxy_core::{NodeId, ProxyConfig};
use fnproxy_fam::{FamHandle, HttpAgentClient};
use fnproxy_heartbeat::{HeartbeatConfig, HeartbeatController, HeartbeatHandle, Prober};
use fnproxy_ic::{AlwaysReadyResolver, FirstFitPolicy, IcHandle, NoopControlPlaneClient};
use fnproxy_leader::{LeaderElector, MetaStoreLeader, StandaloneLeader};
use fnproxy_meta::InMemoryMetaStore;
use fnproxy_resource::ResourceViewHandle;
use fnproxy_service::service::LssService;
use fnproxy_service::types::{GracefulShutdownRequest, QueryAgentInfoRequest, QueryResourcesInfoRequest};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Probes an agent's liveness by attempting a raw TCP connection.
///
/// The actual health RPC is left to the real agent transport (out of this
/// core's scope, per the governing spec); a reachable socket is the cheapest
/// signal that does not require one.
struct TcpConnectProber;

#[async_trait]
impl Prober for TcpConnectProber {
    async fn probe(&self, address: &str) -> bool {
        tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(address))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Application state shared across HTTP handlers.
#[derive(Clone)]
struct AppState {
    lss: Arc<LssService>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy", service: "fnproxy-service" })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!(leader_state = ?state.lss.leader_state(), "readiness check");
    (StatusCode::OK, "ready")
}

/// Read-only ops surface backing `fnproxy-cli`; not part of the upstream wire
/// protocol (spec §6), which this binary's `LssService` dispatches in-process
/// rather than over HTTP.
async fn agents_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.lss.query_agent_info(QueryAgentInfoRequest).await)
}

async fn resources_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.lss.query_resources_info(QueryResourcesInfoRequest).await)
}

async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.lss.graceful_shutdown(GracefulShutdownRequest).await {
        Ok(()) => (StatusCode::OK, "shutdown complete").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/v1/agents", get(agents_handler))
        .route("/v1/resources", get(resources_handler))
        .route("/v1/shutdown", post(shutdown_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,fnproxy=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting fnproxy-service");

    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let node_id = std::env::var("NODE_ID")
        .ok()
        .and_then(|raw| NodeId::from_hex(&raw).ok())
        .unwrap_or_else(NodeId::generate);

    let config = Arc::new(ProxyConfig::from_env());
    tracing::info!(node_id = %node_id, "loaded configuration");

    let agent_store = Arc::new(InMemoryMetaStore::new());
    let bundle_store = Arc::new(InMemoryMetaStore::new());
    let leader_store = Arc::new(InMemoryMetaStore::new());

    let resource_view = ResourceViewHandle::spawn();
    let heartbeat: Arc<dyn HeartbeatHandle> = HeartbeatController::new(
        TcpConnectProber,
        HeartbeatConfig { interval: Duration::from_millis(config.ping_cycle_ms), miss_count: config.ping_times },
    );

    let fam = FamHandle::spawn(
        node_id,
        Arc::clone(&config),
        agent_store,
        resource_view.clone(),
        heartbeat,
        Arc::new(HttpAgentClient::default()),
    );
    let bm = fnproxy_bm::BmHandle::spawn(
        node_id,
        Arc::clone(&config),
        bundle_store,
        resource_view.clone(),
        Arc::new(fnproxy_bm::NoopSchedulerClient),
    );
    let ic = IcHandle::spawn(
        Arc::clone(&config),
        resource_view.clone(),
        fam.clone(),
        bm.clone(),
        Arc::new(FirstFitPolicy),
        Arc::new(NoopControlPlaneClient),
        Arc::new(AlwaysReadyResolver),
    );

    // Bind the Deferred slots that break the FAM <-> IC/BM dependency cycle.
    fam.instance_sync_slot().bind(Arc::new(ic.clone()));
    fam.bundle_sync_slot().bind(Arc::new(bm.clone()));

    let standalone = std::env::var("FNPROXY_STANDALONE_LEADER").map(|v| v == "1").unwrap_or(true);
    let leader: Arc<dyn LeaderElector> = if standalone {
        Arc::new(StandaloneLeader::default())
    } else {
        MetaStoreLeader::spawn(leader_store, b"/yr/leader".to_vec(), node_id.to_hex(), Duration::from_secs(5))
    };

    let lss = Arc::new(LssService::new(fam, ic, resource_view, leader));

    let state = AppState { lss };
    let app = create_router(state);

    tracing::info!(listen_addr = %listen_addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
