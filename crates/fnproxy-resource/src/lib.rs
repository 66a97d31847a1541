//! Resource View (R): the in-memory hierarchical map of capacity/usage per
//! agent, run as a single-threaded actor as described in the concurrency
//! model — only this actor ever mutates the tree, addressed by a
//! [`ResourceViewHandle`] held by every other component.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::collections::HashMap;

use fnproxy_core::{ProxyError, Result, UnitStatus};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use fnproxy_core::{ResourceUnit, UpdateType};

enum Command {
    AddUnit(ResourceUnit, oneshot::Sender<Result<()>>),
    UpdateUnit(ResourceUnit, UpdateType, oneshot::Sender<Result<()>>),
    DeleteUnit(String, oneshot::Sender<Result<()>>),
    UpdateUnitStatus(String, UnitStatus, oneshot::Sender<Result<()>>),
    GetUnit(String, oneshot::Sender<Option<ResourceUnit>>),
    SerializeView(oneshot::Sender<Vec<ResourceUnit>>),
}

struct Actor {
    units: HashMap<String, ResourceUnit>,
    rx: mpsc::Receiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::AddUnit(unit, reply) => {
                    let result = self.add_unit(unit);
                    let _ = reply.send(result);
                }
                Command::UpdateUnit(unit, kind, reply) => {
                    let result = self.update_unit(unit, kind);
                    let _ = reply.send(result);
                }
                Command::DeleteUnit(id, reply) => {
                    let result = self.delete_unit(&id);
                    let _ = reply.send(result);
                }
                Command::UpdateUnitStatus(id, status, reply) => {
                    let result = self.update_unit_status(&id, status);
                    let _ = reply.send(result);
                }
                Command::GetUnit(id, reply) => {
                    let _ = reply.send(self.units.get(&id).cloned());
                }
                Command::SerializeView(reply) => {
                    let _ = reply.send(self.units.values().cloned().collect());
                }
            }
        }
        debug!("resource view actor shutting down: no more handles");
    }

    fn add_unit(&mut self, unit: ResourceUnit) -> Result<()> {
        debug!(id = %unit.id, "adding resource unit");
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    fn update_unit(&mut self, unit: ResourceUnit, kind: UpdateType) -> Result<()> {
        debug!(id = %unit.id, kind = ?kind, "updating resource unit");
        // Actual updates replace the reported shape outright; Virtual updates
        // (bundle pre-deduction) only ever touch usage/fragment, never capacity,
        // so a stray virtual update can never erase an agent's reported capacity.
        match kind {
            UpdateType::Actual => {
                self.units.insert(unit.id.clone(), unit);
            }
            UpdateType::Virtual => {
                let entry = self
                    .units
                    .get_mut(&unit.id)
                    .ok_or_else(|| ProxyError::NotFound(format!("unit {}", unit.id)))?;
                entry.usage = unit.usage;
                entry.fragment = unit.fragment;
                entry.instances = unit.instances;
            }
        }
        Ok(())
    }

    fn delete_unit(&mut self, id: &str) -> Result<()> {
        debug!(%id, "deleting resource unit");
        self.units.remove(id);
        Ok(())
    }

    fn update_unit_status(&mut self, id: &str, status: UnitStatus) -> Result<()> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| ProxyError::NotFound(format!("unit {id}")))?;
        if !unit.status.can_transition_to(status) {
            warn!(%id, from = ?unit.status, to = ?status, "rejected non-monotonic unit status transition");
            return Err(ProxyError::ParameterError(format!(
                "unit {id} cannot transition from {:?} to {status:?}",
                unit.status
            )));
        }
        unit.status = status;
        Ok(())
    }
}

/// A handle to a running Resource View actor.
///
/// Cloning a handle is cheap; every clone addresses the same actor and
/// mutations serialize through its mailbox.
#[derive(Clone)]
pub struct ResourceViewHandle {
    tx: mpsc::Sender<Command>,
}

impl ResourceViewHandle {
    /// Spawn a fresh Resource View actor and return a handle to it.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor { units: HashMap::new(), rx };
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Add a new unit to the view.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor has shut down.
    pub async fn add_unit(&self, unit: ResourceUnit) -> Result<()> {
        self.call(|reply| Command::AddUnit(unit, reply)).await
    }

    /// Update an existing unit's capacity/usage/fragment shape.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] for a `Virtual` update against an unknown unit.
    pub async fn update_unit(&self, unit: ResourceUnit, kind: UpdateType) -> Result<()> {
        self.call(|reply| Command::UpdateUnit(unit, kind, reply)).await
    }

    /// Remove a unit from the view.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor has shut down.
    pub async fn delete_unit(&self, id: impl Into<String>) -> Result<()> {
        self.call(|reply| Command::DeleteUnit(id.into(), reply)).await
    }

    /// Transition a unit's lifecycle status, enforcing monotonicity.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] if the unit is unknown, or
    /// [`ProxyError::ParameterError`] for a forbidden transition.
    pub async fn update_unit_status(&self, id: impl Into<String>, status: UnitStatus) -> Result<()> {
        self.call(|reply| Command::UpdateUnitStatus(id.into(), status, reply)).await
    }

    /// Fetch a unit by id.
    pub async fn get_unit(&self, id: impl Into<String>) -> Option<ResourceUnit> {
        let id = id.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::GetUnit(id, reply_tx)).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    /// Snapshot the entire view.
    pub async fn serialize_view(&self) -> Vec<ResourceUnit> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::SerializeView(reply_tx)).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    async fn call<F>(&self, make_cmd: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| ProxyError::InnerCommunication("resource view actor unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| ProxyError::InnerCommunication("resource view actor dropped reply".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn unit(id: &str) -> ResourceUnit {
        ResourceUnit::new(id, Map::from([("CPU".to_string(), 100.0)]))
    }

    #[tokio::test]
    async fn add_then_get_roundtrips() {
        let view = ResourceViewHandle::spawn();
        view.add_unit(unit("a1")).await.unwrap();
        let fetched = view.get_unit("a1").await.unwrap();
        assert_eq!(fetched.id, "a1");
    }

    #[tokio::test]
    async fn virtual_update_on_unknown_unit_is_rejected() {
        let view = ResourceViewHandle::spawn();
        let err = view.update_unit(unit("ghost"), UpdateType::Virtual).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_transition_normal_to_recovering_is_rejected() {
        let view = ResourceViewHandle::spawn();
        view.add_unit(unit("a1")).await.unwrap();
        let err = view
            .update_unit_status("a1", UnitStatus::Recovering)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ParameterError(_)));
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let view = ResourceViewHandle::spawn();
        view.add_unit(unit("a1")).await.unwrap();
        view.delete_unit("a1").await.unwrap();
        assert!(view.get_unit("a1").await.is_none());
    }

    #[tokio::test]
    async fn serialize_view_lists_every_unit() {
        let view = ResourceViewHandle::spawn();
        view.add_unit(unit("a1")).await.unwrap();
        view.add_unit(unit("a2")).await.unwrap();
        let snapshot = view.serialize_view().await;
        assert_eq!(snapshot.len(), 2);
    }
}
