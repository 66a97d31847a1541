//! The shared `ResourceUnit` shape used by the Resource View and its callers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether a resource mutation reflects a concrete allocation or a bundle's
/// pre-deduction against the virtual view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// A real allocation backed by an agent's reported capacity.
    Actual,
    /// A speculative pre-deduction made while a bundle reservation is outstanding.
    Virtual,
}

/// Lifecycle phase of a [`ResourceUnit`].
///
/// Transitions are monotonic within a lifecycle phase: `Recovering -> Normal`
/// is allowed, `Normal -> Recovering` is not except via explicit
/// re-registration (the caller is expected to delete and re-add the unit in
/// that case rather than force the transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Healthy and eligible for further allocation.
    Normal,
    /// Mid-recovery (e.g. a restarted agent whose view has not yet re-synced).
    Recovering,
    /// Mid-eviction; no further allocation should target this unit.
    Evicting,
}

impl UnitStatus {
    /// Whether `self -> next` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Recovering, Self::Normal)
                | (Self::Normal, Self::Evicting)
                | (Self::Recovering, Self::Evicting)
                | (Self::Normal, Self::Normal)
                | (Self::Recovering, Self::Recovering)
                | (Self::Evicting, Self::Evicting)
        )
    }
}

/// A node in the Resource View's hierarchical capacity/usage tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUnit {
    /// Identity of this unit (an `AgentId`, `BundleId`, or the node itself, hex-encoded).
    pub id: String,
    /// Identity of the owning unit, if this is a fragment of a larger unit.
    pub owner_id: Option<String>,
    /// Total capacity per resource kind (e.g. `"CPU" -> 100.0`).
    pub capacity: HashMap<String, f64>,
    /// Currently allocated usage per resource kind.
    pub usage: HashMap<String, f64>,
    /// Nested sub-allocations, keyed by their own id.
    pub fragment: HashMap<String, ResourceUnit>,
    /// Lifecycle status of this unit.
    pub status: UnitStatus,
    /// Instance ids currently attributed to this unit, hex-encoded.
    pub instances: Vec<String>,
}

impl ResourceUnit {
    /// Construct a fresh unit with no usage and no fragments.
    #[must_use]
    pub fn new(id: impl Into<String>, capacity: HashMap<String, f64>) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
            capacity,
            usage: HashMap::new(),
            fragment: HashMap::new(),
            status: UnitStatus::Normal,
            instances: Vec::new(),
        }
    }

    /// Remaining capacity for a given resource kind.
    #[must_use]
    pub fn remaining(&self, kind: &str) -> f64 {
        let cap = self.capacity.get(kind).copied().unwrap_or(0.0);
        let used = self.usage.get(kind).copied().unwrap_or(0.0);
        (cap - used).max(0.0)
    }

    /// Whether `request` fits within this unit's remaining capacity for every kind it names.
    #[must_use]
    pub fn can_allocate(&self, request: &HashMap<String, f64>) -> bool {
        request.iter().all(|(kind, amount)| self.remaining(kind) >= *amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovering_to_normal_allowed() {
        assert!(UnitStatus::Recovering.can_transition_to(UnitStatus::Normal));
    }

    #[test]
    fn normal_to_recovering_forbidden() {
        assert!(!UnitStatus::Normal.can_transition_to(UnitStatus::Recovering));
    }

    #[test]
    fn remaining_capacity_floors_at_zero() {
        let mut unit = ResourceUnit::new("a1", HashMap::from([("CPU".to_string(), 10.0)]));
        unit.usage.insert("CPU".to_string(), 15.0);
        assert_eq!(unit.remaining("CPU"), 0.0);
    }

    #[test]
    fn can_allocate_checks_every_requested_kind() {
        let unit = ResourceUnit::new(
            "a1",
            HashMap::from([("CPU".to_string(), 10.0), ("MEM".to_string(), 1024.0)]),
        );
        let ok = HashMap::from([("CPU".to_string(), 5.0)]);
        let too_much = HashMap::from([("MEM".to_string(), 2048.0)]);
        assert!(unit.can_allocate(&ok));
        assert!(!unit.can_allocate(&too_much));
    }
}
