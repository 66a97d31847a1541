//! A deferred-binding slot for a peer dependency.
//!
//! The source models cross-component back-edges (IC ↔ FAM ↔ BM ↔ LSS) with
//! `shared_ptr`/`weak_ptr` cycles. This is the Rust replacement named in the
//! design notes: rather than one component owning another, a component
//! exposes a [`Deferred`] slot for the peer it needs to call back into, and
//! whoever wires the system together `bind`s the slot once every component
//! has been constructed. No component owns another, and nothing needs a weak
//! reference to break a cycle.

use std::sync::Arc;

use tokio::sync::RwLock;

/// A slot that starts empty and is bound exactly once during system wiring.
pub struct Deferred<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Deferred<T> {
    /// Construct an unbound slot.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(None) }
    }

    /// Bind the slot to `value`. Intended to be called once, during wiring.
    pub async fn bind(&self, value: Arc<T>) {
        *self.inner.write().await = Some(value);
    }

    /// Fetch the bound value, if wiring has completed.
    pub async fn get(&self) -> Option<Arc<T>> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbound_slot_is_empty() {
        let slot: Deferred<str> = Deferred::new();
        assert!(slot.get().await.is_none());
    }

    #[tokio::test]
    async fn bound_slot_returns_the_value() {
        let slot: Deferred<str> = Deferred::new();
        slot.bind(Arc::from("peer")).await;
        assert_eq!(slot.get().await.as_deref(), Some("peer"));
    }
}
