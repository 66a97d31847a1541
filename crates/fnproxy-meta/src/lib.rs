//! Metastore client contract: `Get`/`Put`/`Delete`, a transactional multi-op, and
//! resumable-revision `Watch`, against a strongly-consistent KV store.
//!
//! This is deliberately a separate abstraction from a node-local store: every
//! write here is expected to be linearizable cluster-wide, and every read may
//! be resumed from a prior revision after a reconnect. The in-memory
//! implementation backs tests and single-node operation; the `etcd` feature
//! adds a production implementation over `etcd-client`, matching the source
//! system's etcd-backed metastore.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod coalesce;
mod error;
mod memory;
mod watch;

#[cfg(feature = "etcd")]
mod etcd_store;

pub use coalesce::CoalescingPersister;
pub use error::{MetaStoreError, Result};
pub use memory::InMemoryMetaStore;
pub use watch::{WatchEvent, WatchEventKind, WatchStream};

#[cfg(feature = "etcd")]
pub use etcd_store::EtcdMetaStore;

use async_trait::async_trait;

/// A single KV entry with the revision at which it was last written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The entry's key.
    pub key: Vec<u8>,
    /// The entry's value.
    pub value: Vec<u8>,
    /// The store-wide revision this entry was last written at.
    pub revision: i64,
}

/// One operation within a transactional multi-op. All ops in a `txn` either
/// all apply, atomically, or none do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Write `key -> value`.
    Put {
        /// Key to write.
        key: Vec<u8>,
        /// Value to write.
        value: Vec<u8>,
    },
    /// Remove `key`, if present.
    Delete {
        /// Key to remove.
        key: Vec<u8>,
    },
}

/// A strongly-consistent KV store with watch semantics.
///
/// Implementations must be safe to hold behind a shared reference and to call
/// concurrently; callers rely on this (e.g. FAM's persisted-write coalescing
/// issues overlapping `put`s against the same key from different tasks).
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch the current value of `key`, if any.
    async fn get(&self, key: &[u8]) -> Result<Option<KvEntry>>;

    /// Write `key -> value`, returning the revision the write landed at.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<i64>;

    /// Remove `key`, if present.
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply every op in `ops` atomically.
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<i64>;

    /// Watch every key under `prefix`, starting either at the current revision
    /// (`start_revision = None`) or resuming from a previously observed
    /// revision (`start_revision = Some(rev)`), so a reconnecting watcher
    /// does not miss events that landed while it was disconnected.
    async fn watch(&self, prefix: &[u8], start_revision: Option<i64>) -> Result<WatchStream>;
}
