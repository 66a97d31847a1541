//! The enumerated configuration surface for the local scheduler, with the
//! defaults named in the external-interfaces section of the governing spec.

use serde::{Deserialize, Serialize};

/// All tunables for FAM/BM/IC, loaded once at process start and shared
/// read-only (`Arc<ProxyConfig>`) by every actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// RPC retry budget before a deploy/kill future resolves to `InnerCommunication`.
    pub retry_times: u32,
    /// Cadence, in milliseconds, between RPC retries.
    pub retry_cycle_ms: u64,
    /// Consecutive heartbeat misses tolerated before an agent is declared lost.
    pub ping_times: u32,
    /// Heartbeat probe interval, in milliseconds.
    pub ping_cycle_ms: u64,
    /// Pacing, in milliseconds, between retries of the startup metastore sync.
    pub get_agent_info_retry_ms: u64,
    /// GC window, in milliseconds, before a `Failed` agent is purged from the persisted blob.
    pub invalid_agent_gc_interval_ms: u64,
    /// Timeout, in seconds, for a bundle reservation to be bound before it is released.
    pub bundle_reserve_timeout_ms: u64,
    /// Whether the tenant-affinity advisory cache and its policy hooks are active.
    pub enable_tenant_affinity: bool,
    /// Whether an agent-exit cleanup should also request pod deletion from the scheduler.
    pub enable_force_delete_pod: bool,
    /// How long a tenant's pod placement is considered reusable after its last instance exits.
    pub tenant_pod_reuse_time_window_sec: u64,
    /// Timeout, in milliseconds, for `query_instance_status`.
    pub query_timeout_ms: u64,
    /// Timeout, in milliseconds, for `update_cred`.
    pub update_token_timeout_ms: u64,
    /// Retry budget for the best-effort `CleanStatus` exchange.
    pub max_retry_send_clean_status_times: u32,
    /// Retry budget for forwarding a kill to a non-co-located instance.
    pub max_forward_kill_retry_times: u32,
    /// Cadence, in milliseconds, between forward-kill retries.
    pub max_forward_kill_retry_cycle_ms: u64,
    /// Re-enqueue budget for a Recoverable instance before it is declared `Failed`.
    pub recover_retry_times: u32,
    /// How long an admitted schedule request may sit in IC's queue with no
    /// capacity before it is failed with "resource not enough".
    pub schedule_queue_timeout_ms: u64,
    /// Cadence, in milliseconds, on which IC clears its forward-kill rate limiter.
    pub rate_limiter_clear_cycle_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            retry_times: 6,
            retry_cycle_ms: 10_000,
            ping_times: 10,
            ping_cycle_ms: 1_000,
            get_agent_info_retry_ms: 3_000,
            invalid_agent_gc_interval_ms: 15 * 60 * 1_000,
            bundle_reserve_timeout_ms: 120_000,
            enable_tenant_affinity: true,
            enable_force_delete_pod: true,
            tenant_pod_reuse_time_window_sec: 300,
            query_timeout_ms: 5_000,
            update_token_timeout_ms: 5_000,
            max_retry_send_clean_status_times: 3,
            max_forward_kill_retry_times: 3,
            max_forward_kill_retry_cycle_ms: 1_000,
            recover_retry_times: 3,
            schedule_queue_timeout_ms: 30_000,
            rate_limiter_clear_cycle_ms: 60_000,
        }
    }
}

impl ProxyConfig {
    /// Load configuration, applying environment-variable overrides on top of the
    /// documented defaults (`FNPROXY_RETRY_TIMES`, `FNPROXY_PING_CYCLE_MS`, ...).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        macro_rules! override_from_env {
            ($field:ident, $env_name:literal) => {
                if let Ok(raw) = std::env::var($env_name) {
                    if let Ok(parsed) = raw.parse() {
                        config.$field = parsed;
                    }
                }
            };
        }
        override_from_env!(retry_times, "FNPROXY_RETRY_TIMES");
        override_from_env!(retry_cycle_ms, "FNPROXY_RETRY_CYCLE_MS");
        override_from_env!(ping_times, "FNPROXY_PING_TIMES");
        override_from_env!(ping_cycle_ms, "FNPROXY_PING_CYCLE_MS");
        override_from_env!(get_agent_info_retry_ms, "FNPROXY_GET_AGENT_INFO_RETRY_MS");
        override_from_env!(invalid_agent_gc_interval_ms, "FNPROXY_INVALID_AGENT_GC_INTERVAL_MS");
        override_from_env!(bundle_reserve_timeout_ms, "FNPROXY_BUNDLE_RESERVE_TIMEOUT_MS");
        override_from_env!(enable_tenant_affinity, "FNPROXY_ENABLE_TENANT_AFFINITY");
        override_from_env!(enable_force_delete_pod, "FNPROXY_ENABLE_FORCE_DELETE_POD");
        override_from_env!(tenant_pod_reuse_time_window_sec, "FNPROXY_TENANT_POD_REUSE_TIME_WINDOW_SEC");
        override_from_env!(query_timeout_ms, "FNPROXY_QUERY_TIMEOUT_MS");
        override_from_env!(update_token_timeout_ms, "FNPROXY_UPDATE_TOKEN_TIMEOUT_MS");
        override_from_env!(max_retry_send_clean_status_times, "FNPROXY_MAX_RETRY_SEND_CLEAN_STATUS_TIMES");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.retry_times, 6);
        assert_eq!(config.retry_cycle_ms, 10_000);
        assert_eq!(config.ping_times, 10);
        assert_eq!(config.bundle_reserve_timeout_ms, 120_000);
        assert_eq!(config.invalid_agent_gc_interval_ms, 900_000);
    }
}
