//! The pluggable filter/score decision point for **primary** (concrete
//! capacity) admission. Mirrors the spec's framing exactly: "Scheduling-
//! decision plugins (filter/score) are external; IC supplies only their
//! invocation points." BM owns the equivalent decision point for
//! bundle-backed (virtual) requests via its own `SchedulerClient`.

use async_trait::async_trait;
use fnproxy_bm::ScheduleRequest;
use fnproxy_core::ResourceUnit;

/// Picks an agent for a primary (non-bundle-backed) schedule request out of
/// the current resource view.
#[async_trait]
pub trait SchedulingPolicy: Send + Sync {
    /// Filter and score `candidates`, returning the chosen unit's `id` (an
    /// `AgentId`, hex-encoded), or `None` if nothing fits.
    async fn select_agent(&self, req: &ScheduleRequest, candidates: &[ResourceUnit]) -> Option<String>;
}

/// Picks the first candidate whose remaining capacity covers every requested
/// resource kind. No load-balancing, no affinity/label matching beyond what
/// the caller already filtered into `candidates`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitPolicy;

#[async_trait]
impl SchedulingPolicy for FirstFitPolicy {
    async fn select_agent(&self, req: &ScheduleRequest, candidates: &[ResourceUnit]) -> Option<String> {
        candidates.iter().find(|unit| unit.can_allocate(&req.resource_spec)).map(|unit| unit.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn req(spec: HashMap<String, f64>) -> ScheduleRequest {
        ScheduleRequest {
            request_id: fnproxy_core::RequestId::generate(),
            instance_id: fnproxy_core::InstanceId::generate(),
            resource_spec: spec,
            labels: HashMap::new(),
            resource_group_ref: String::new(),
            affinity: None,
            priority: 0,
            trace_id: "t1".into(),
        }
    }

    #[tokio::test]
    async fn picks_first_unit_with_enough_capacity() {
        let small = ResourceUnit::new("a1", HashMap::from([("CPU".to_string(), 1.0)]));
        let big = ResourceUnit::new("a2", HashMap::from([("CPU".to_string(), 10.0)]));
        let request = req(HashMap::from([("CPU".to_string(), 4.0)]));

        let chosen = FirstFitPolicy.select_agent(&request, &[small, big]).await;
        assert_eq!(chosen.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn no_candidate_fits() {
        let small = ResourceUnit::new("a1", HashMap::from([("CPU".to_string(), 1.0)]));
        let request = req(HashMap::from([("CPU".to_string(), 4.0)]));
        assert!(FirstFitPolicy.select_agent(&request, &[small]).await.is_none());
    }
}
